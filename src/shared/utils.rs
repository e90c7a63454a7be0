use anyhow::{Context, Result};
use diesel::{
    r2d2::{ConnectionManager, Pool},
    PgConnection,
};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .build(manager)
        .context("Failed to build database connection pool")
}

/// Strips everything but digits from a phone number. Loop prevention and
/// self-send filtering compare numbers in this form so `+55 11 9...` and
/// `5511 9...` collapse to the same key.
pub fn digits_only(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn same_phone(a: &str, b: &str) -> bool {
    let (a, b) = (digits_only(a), digits_only(b));
    !a.is_empty() && a == b
}

/// Normalizes a Google Drive share link into a direct-download URL.
/// Non-Drive URLs pass through untouched.
pub fn normalize_drive_url(url: &str) -> String {
    if !url.contains("drive.google.com") {
        return url.to_string();
    }
    let file_id = url
        .split_once("/file/d/")
        .map(|(_, rest)| rest.split(['/', '?']).next().unwrap_or(""))
        .or_else(|| {
            url.split_once("id=")
                .map(|(_, rest)| rest.split('&').next().unwrap_or(""))
        });
    match file_id {
        Some(id) if !id.is_empty() => {
            format!("https://drive.google.com/uc?export=download&id={}", id)
        }
        _ => url.to_string(),
    }
}

/// Conversation previews are capped so list views stay cheap to render.
pub fn preview_of(body: &str) -> String {
    const MAX: usize = 120;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{}…", cut)
    }
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_only_strips_formatting() {
        assert_eq!(digits_only("+91 12345-00001"), "911234500001");
        assert_eq!(digits_only("911234500001"), "911234500001");
    }

    #[test]
    fn same_phone_ignores_plus_and_spaces() {
        assert!(same_phone("+91 1234500001", "911234500001"));
        assert!(!same_phone("911234500001", "911234500002"));
        assert!(!same_phone("", ""));
    }

    #[test]
    fn drive_share_link_becomes_direct_download() {
        let url = "https://drive.google.com/file/d/1AbC_dEf/view?usp=sharing";
        assert_eq!(
            normalize_drive_url(url),
            "https://drive.google.com/uc?export=download&id=1AbC_dEf"
        );
    }

    #[test]
    fn drive_open_link_becomes_direct_download() {
        let url = "https://drive.google.com/open?id=1AbC&foo=1";
        assert_eq!(
            normalize_drive_url(url),
            "https://drive.google.com/uc?export=download&id=1AbC"
        );
    }

    #[test]
    fn non_drive_url_untouched() {
        assert_eq!(
            normalize_drive_url("https://example.com/a.png"),
            "https://example.com/a.png"
        );
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let long = "x".repeat(300);
        let p = preview_of(&long);
        assert_eq!(p.chars().count(), 121);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
