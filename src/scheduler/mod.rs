//! Minute-resolution scheduler: wakes due broadcasts and flushes pending
//! scheduled notifications (abandoned-cart reminders and similar).

use crate::broadcast::BroadcastDispatcher;
use crate::provider::envelope::{build_template_components, Outbound};
use crate::provider::CloudApiClient;
use crate::shared::errors::AppResult;
use crate::shared::models::schema::{broadcasts, organizations, scheduled_notifications};
use crate::shared::models::{Organization, ScheduledNotification};
use crate::shared::state::AppState;
use crate::shared::utils::digits_only;
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use log::{error, info};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

const TICK: Duration = Duration::from_secs(60);
/// Tolerates clock skew between the scheduling client and this process.
const WAKE_GRACE_SECS: i64 = 30;
const NOTIFICATION_BATCH: i64 = 50;

pub struct SchedulerService {
    state: Arc<AppState>,
}

impl SchedulerService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn spawn(self) {
        let mut ticker = interval(TICK);
        loop {
            ticker.tick().await;
            if let Err(e) = self.wake_due_broadcasts().await {
                error!("scheduler: broadcast wake failed: {}", e);
            }
            if let Err(e) = self.dispatch_pending_notifications().await {
                error!("scheduler: notification dispatch failed: {}", e);
            }
        }
    }

    async fn wake_due_broadcasts(&self) -> AppResult<()> {
        let horizon = Utc::now() + ChronoDuration::seconds(WAKE_GRACE_SECS);
        let due: Vec<Uuid> = {
            let mut conn = self.state.conn.get()?;
            broadcasts::table
                .filter(broadcasts::status.eq("scheduled"))
                .filter(broadcasts::scheduled_at.le(horizon))
                .select(broadcasts::id)
                .load(&mut conn)?
        };

        for broadcast_id in due {
            info!("scheduler waking broadcast {}", broadcast_id);
            let dispatcher = BroadcastDispatcher::new(Arc::clone(&self.state));
            tokio::spawn(async move {
                if let Err(e) = dispatcher.start(broadcast_id).await {
                    error!("scheduled broadcast {} failed: {}", broadcast_id, e);
                }
            });
        }
        Ok(())
    }

    async fn dispatch_pending_notifications(&self) -> AppResult<()> {
        let pending: Vec<ScheduledNotification> = {
            let mut conn = self.state.conn.get()?;
            scheduled_notifications::table
                .filter(scheduled_notifications::status.eq("pending"))
                .filter(scheduled_notifications::scheduled_at.le(Utc::now()))
                .order(scheduled_notifications::scheduled_at.asc())
                .limit(NOTIFICATION_BATCH)
                .select(ScheduledNotification::as_select())
                .load(&mut conn)?
        };

        for notification in pending {
            match self.send_notification(&notification).await {
                Ok(()) => {
                    let mut conn = self.state.conn.get()?;
                    diesel::update(
                        scheduled_notifications::table
                            .filter(scheduled_notifications::id.eq(notification.id)),
                    )
                    .set(scheduled_notifications::status.eq("sent"))
                    .execute(&mut conn)?;
                }
                Err(e) => {
                    error!(
                        "scheduled notification {} ({}) failed: {}",
                        notification.id, notification.external_id, e
                    );
                    let mut conn = self.state.conn.get()?;
                    diesel::update(
                        scheduled_notifications::table
                            .filter(scheduled_notifications::id.eq(notification.id)),
                    )
                    .set((
                        scheduled_notifications::status.eq("failed"),
                        scheduled_notifications::error.eq(e.to_string()),
                    ))
                    .execute(&mut conn)?;
                }
            }
        }
        Ok(())
    }

    async fn send_notification(&self, notification: &ScheduledNotification) -> AppResult<()> {
        let org: Organization = {
            let mut conn = self.state.conn.get()?;
            organizations::table
                .filter(organizations::id.eq(notification.org_id))
                .select(Organization::as_select())
                .first(&mut conn)?
        };

        let language = notification
            .payload
            .get("language")
            .and_then(|l| l.as_str())
            .unwrap_or("en")
            .to_string();
        let empty = serde_json::Map::new();
        let params = notification
            .payload
            .get("params")
            .and_then(|p| p.as_object())
            .unwrap_or(&empty);

        let outbound = Outbound::Template {
            name: notification.template_name.clone(),
            language,
            components: build_template_components(None, params),
        };
        let client = CloudApiClient::for_org(self.state.http.clone(), &self.state.config, &org);
        client
            .send(&digits_only(&notification.phone), &outbound)
            .await?;
        Ok(())
    }
}
