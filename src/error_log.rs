// Error log - collected diagnostics from Vulkan setup
//
// Setup failures and validation-layer messages are gathered here and dumped
// once, after initialization, as a single banner-delimited report.

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const ERROR_BANNER: &str = "=====Error=====";
const ERROR_FOOTER: &str = "===============";
const CLEAN_BANNER: &str = "=====Non Error=====";

/// Shared list of human-readable error messages.
///
/// Cloning is cheap and every clone appends to the same list, which lets the
/// debug messenger callback report into it from driver threads.
#[derive(Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        self.entries.lock().push(message.into());
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Copy of the entries recorded so far, taken under a single lock
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Report text, one line per entry between the error banners
    #[cfg(test)]
    pub fn render(&self) -> String {
        render_entries(&self.snapshot())
    }

    /// Dump the report to the log, and append it to `log_file` when given.
    ///
    /// Messages pushed while reporting are left for the next report.
    pub fn report(&self, log_file: Option<&Path>) {
        let entries = self.snapshot();
        let report = render_entries(&entries);

        if entries.is_empty() {
            log::info!("{}", CLEAN_BANNER);
        } else {
            log::error!("{} error(s) during setup", entries.len());
            for line in report.lines() {
                log::error!("{}", line);
            }
        }

        if let Some(path) = log_file {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| file.write_all(report.as_bytes()));
            if let Err(e) = written {
                log::warn!("Failed to write error report to {:?}: {}", path, e);
            }
        }
    }
}

fn render_entries(entries: &[String]) -> String {
    if entries.is_empty() {
        return format!("{}\n", CLEAN_BANNER);
    }

    let mut out = String::new();
    out.push_str(ERROR_BANNER);
    out.push('\n');
    for entry in entries {
        out.push_str(entry);
        out.push('\n');
    }
    out.push_str(ERROR_FOOTER);
    out.push('\n');
    out
}

impl std::fmt::Debug for ErrorLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.lock().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_renders_clean_banner() {
        let errors = ErrorLog::new();
        assert!(errors.is_empty());
        assert_eq!(errors.render(), "=====Non Error=====\n");
    }

    #[test]
    fn entries_render_between_banners_in_order() {
        let errors = ErrorLog::new();
        errors.push("Create instance failed");
        errors.push(String::from("Create device failed"));

        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.render(),
            "=====Error=====\nCreate instance failed\nCreate device failed\n===============\n"
        );
    }

    #[test]
    fn clones_share_entries() {
        let errors = ErrorLog::new();
        let callback_side = errors.clone();
        callback_side.push("validation error");
        assert_eq!(errors.len(), 1);
        assert!(errors.render().contains("validation error"));
    }

    #[test]
    fn pushes_from_other_threads_are_collected() {
        let errors = ErrorLog::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let errors = errors.clone();
                std::thread::spawn(move || errors.push(format!("thread {}", i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_pushes() {
        let errors = ErrorLog::new();
        errors.push("first");
        let entries = errors.snapshot();
        errors.push("second");

        assert_eq!(entries, vec!["first".to_string()]);
        assert_eq!(
            render_entries(&entries),
            "=====Error=====\nfirst\n===============\n"
        );
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn report_body_matches_one_snapshot_under_concurrent_pushes() {
        let path =
            std::env::temp_dir().join(format!("lava-concurrent-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let errors = ErrorLog::new();
        errors.push("initial");
        let pusher = {
            let errors = errors.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    errors.push(format!("late {}", i));
                }
            })
        };
        errors.report(Some(&path));
        pusher.join().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("=====Error====="));
        assert_eq!(lines.next_back(), Some("==============="));
        assert_eq!(lines.next(), Some("initial"));
        assert!(lines.all(|line| line.starts_with("late ")));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn report_appends_to_log_file() {
        let path = std::env::temp_dir().join(format!("lava-report-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let errors = ErrorLog::new();
        errors.push("vkCreateFence failed");
        errors.report(Some(&path));
        errors.report(Some(&path));

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.matches("vkCreateFence failed").count(), 2);
        let _ = std::fs::remove_file(path);
    }
}
