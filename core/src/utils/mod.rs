pub mod payload_loader;

use std::fs::File;
use std::io;
use std::io::BufRead;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::error;

/// Reads a file line-by-line, returning all non-empty trimmed lines.
pub fn read_lines(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let file = File::open(path.as_ref())?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .filter_map(|line| {
            let line = line.ok()?;
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .collect();
    Ok(lines)
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Mutex poisoned for '{}', continuing with recovered state", context);
            poisoned.into_inner()
        }
    }
}

/// Cuts `text` to at most `max` characters, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_read_lines_skips_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  one \n\n\ttwo\n   ").unwrap();
        assert_eq!(read_lines(file.path()).unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_read_lines_missing_file() {
        assert!(read_lines("/definitely/not/here.txt").is_err());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("ééé", 2), "éé");
    }

    #[test]
    fn test_lock_or_recover_after_panic() {
        let shared = Arc::new(Mutex::new(1));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison it");
        })
        .join();

        assert!(shared.is_poisoned());
        let mut guard = lock_or_recover(&shared, "test value");
        *guard += 1;
        assert_eq!(*guard, 2);
    }
}
