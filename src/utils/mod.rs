//! Auxiliary helpers shared across the agent.

pub mod errors;
pub mod logger;

use std::path::Path;

/// Formats a byte count to human readable form, e.g. "20.33 MB".
pub fn h_size(num: u64) -> String {
    let mut n = num as f64;
    for unit in ["bytes", "kB", "MB", "GB", "TB"] {
        if n < 1024.0 {
            return format!("{:.2} {}", n, unit);
        }
        n /= 1024.0;
    }
    format!("{:.2} PB", n)
}

/// Checks whether a directory contains no entries.
pub fn is_dir_empty(dir: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h_size() {
        assert_eq!(h_size(0), "0.00 bytes");
        assert_eq!(h_size(1023), "1023.00 bytes");
        assert_eq!(h_size(1024), "1.00 kB");
        assert_eq!(h_size(20 * 1024 * 1024 + 1024 * 340), "20.33 MB");
    }

    #[test]
    fn test_is_dir_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_dir_empty(dir.path()).unwrap());

        std::fs::write(dir.path().join("x"), b"x").unwrap();
        assert!(!is_dir_empty(dir.path()).unwrap());
    }

    #[test]
    fn test_is_dir_empty_missing_dir() {
        assert!(is_dir_empty(Path::new("/nonexistent/surely/not")).is_err());
    }
}
