//! Workstation stand-ins for the reader peripherals.
//!
//! Badges are typed on stdin, one per line (`04A1B2C3` or `04A1B2C3 -52`),
//! the panel and cues go to the log, and the network is the host's.

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, TryRecvError};

use tapin_core::{
    CardReader, Cue, Display, Feedback, RestartHandler, Screen, StallReport, TagRead, WifiLink,
    WifiProfile,
};
use tracing::{debug, error, info, warn};

/// RSSI reported when a line carries none.
const DEFAULT_RSSI: i16 = -50;

/// Parse one input line into a read.
fn parse_line(line: &str) -> Option<TagRead> {
    let mut parts = line.split_whitespace();
    let tag = parts.next()?.to_uppercase();
    let rssi = parts
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_RSSI);
    Some(TagRead { tag, rssi })
}

/// Card reader fed by lines from a text source.
#[derive(Debug)]
pub struct LineReader {
    lines: Receiver<TagRead>,
    closed: bool,
}

impl LineReader {
    /// Read lines from `source` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<S: BufRead + Send + 'static>(source: S) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("tapin-input".into())
            .spawn(move || {
                for line in source.lines() {
                    let Ok(line) = line else { break };
                    if let Some(read) = parse_line(&line) {
                        if tx.send(read).is_err() {
                            break;
                        }
                    }
                }
            })?;
        Ok(Self {
            lines: rx,
            closed: false,
        })
    }

    /// Reader on stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn stdin() -> std::io::Result<Self> {
        Self::spawn(std::io::BufReader::new(std::io::stdin()))
    }
}

impl CardReader for LineReader {
    fn poll(&mut self) -> tapin_core::Result<Option<TagRead>> {
        match self.lines.try_recv() {
            Ok(read) => Ok(Some(read)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                if !self.closed {
                    self.closed = true;
                    info!("badge input closed");
                }
                Ok(None)
            }
        }
    }
}

/// Cues as log lines.
#[derive(Debug, Default)]
pub struct LogFeedback;

impl Feedback for LogFeedback {
    fn signal(&mut self, cue: Cue) {
        debug!(?cue, "cue");
    }
}

/// Panel as log lines; repeated screens are not logged twice.
#[derive(Debug, Default)]
pub struct LogDisplay {
    last: Option<Screen>,
}

impl Display for LogDisplay {
    fn render(&mut self, screen: &Screen) -> tapin_core::Result<()> {
        if self.last.as_ref() != Some(screen) {
            info!(title = %screen.title, detail = %screen.detail, "display");
            self.last = Some(screen.clone());
        }
        Ok(())
    }
}

/// The host network: always up, joining is a no-op.
#[derive(Debug, Default)]
pub struct HostLink;

impl WifiLink for HostLink {
    async fn is_connected(&mut self) -> bool {
        true
    }

    async fn connect(&mut self, profile: &WifiProfile) -> tapin_core::Result<()> {
        debug!(ssid = %profile.ssid, "host network already joined");
        Ok(())
    }
}

/// Exits non-zero so the service manager restarts the reader.
#[derive(Debug, Default)]
pub struct ProcessRestart;

impl RestartHandler for ProcessRestart {
    fn restart(&self, report: &StallReport) {
        error!(
            task = report.task,
            silent_ms = u64::try_from(report.silent_for.as_millis()).unwrap_or(u64::MAX),
            "task stalled, restarting"
        );
        warn!("exiting for restart");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("04a1b2c3 -61"),
            Some(TagRead {
                tag: "04A1B2C3".into(),
                rssi: -61
            })
        );
        assert_eq!(parse_line("04AA").map(|r| r.rssi), Some(DEFAULT_RSSI));
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn test_line_reader_yields_reads_then_idles() {
        let mut reader = LineReader::spawn(Cursor::new("04AA\n\n04BB -40\n")).unwrap();

        let mut reads = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while reads.len() < 2 && Instant::now() < deadline {
            match reader.poll().unwrap() {
                Some(read) => reads.push(read.tag),
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(reads, ["04AA", "04BB"]);

        std::thread::sleep(Duration::from_millis(20));
        assert!(reader.poll().unwrap().is_none());
    }

    #[test]
    fn test_log_display_accepts_every_screen() {
        let mut display = LogDisplay::default();
        let screen = Screen::default();
        assert!(display.render(&screen).is_ok());
        assert!(display.render(&screen).is_ok());
        assert_eq!(display.last, Some(screen));
    }
}
