//! Display task and screen model.
//!
//! The display task is the lowest-priority consumer on the scan core. It
//! renders discrete announcements from the scan and network tasks and, after
//! a quiet period, falls back to an idle screen built from a link-state
//! snapshot. Character layout is left to the [`Display`] implementation.

use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bounded::Bounded;
use crate::bus::BusLock;
use crate::clock::SyncClock;
use crate::error::Result;
use crate::link::{Connectivity, LinkSnapshot, LinkStateHandle};
use crate::types::{DisplayName, EventKind};
use crate::watchdog::WatchdogToken;

/// One rendered line.
pub type ScreenLine = Bounded<20>;

/// Free-form display text.
pub type DisplayText = Bounded<32>;

/// State announcements accepted by the display task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayMessage {
    /// Joining a network.
    Connecting,
    /// Online and waiting for badges.
    Ready,
    /// A badge is being processed.
    Scanning,
    /// The backend recognized the badge.
    Success {
        /// Recognized identity.
        name: DisplayName,
        /// Advisory classification.
        kind: EventKind,
    },
    /// The scan was stored for later delivery.
    Buffered,
    /// Something went wrong.
    Error(DisplayText),
    /// Maintenance or operator message.
    Custom {
        /// First line.
        title: DisplayText,
        /// Second line.
        detail: DisplayText,
    },
}

impl DisplayMessage {
    /// An error announcement, truncated to fit.
    #[must_use]
    pub fn error(text: &str) -> Self {
        Self::Error(DisplayText::truncated(text))
    }
}

/// What the panel shows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Screen {
    /// Upper line.
    pub title: ScreenLine,
    /// Lower line.
    pub detail: ScreenLine,
}

impl Screen {
    fn new(title: &str, detail: &str) -> Self {
        Self {
            title: ScreenLine::truncated(title),
            detail: ScreenLine::truncated(detail),
        }
    }

    /// Screen for an announcement.
    #[must_use]
    pub fn for_message(message: &DisplayMessage) -> Self {
        match message {
            DisplayMessage::Connecting => Self::new("Connecting", "please wait"),
            DisplayMessage::Ready => Self::new("Ready", "present badge"),
            DisplayMessage::Scanning => Self::new("Reading", "hold still"),
            DisplayMessage::Success { name, kind } => {
                let title = match kind {
                    EventKind::Entry => "Welcome",
                    EventKind::Exit => "Goodbye",
                    EventKind::Generic => "Recorded",
                };
                let detail = if name.is_empty() { "badge accepted" } else { name.as_str() };
                Self::new(title, detail)
            }
            DisplayMessage::Buffered => Self::new("Saved offline", "will sync later"),
            DisplayMessage::Error(text) => Self::new("Error", text.as_str()),
            DisplayMessage::Custom { title, detail } => Self::new(title.as_str(), detail.as_str()),
        }
    }

    /// Idle screen: clock plus link glyph, or the buffered count.
    #[must_use]
    pub fn idle(link: &LinkSnapshot, clock: Option<String>) -> Self {
        let glyph = match (link.connectivity, link.registered) {
            (Connectivity::Connected, true) => '*',
            (Connectivity::Connected, false) => '+',
            (Connectivity::Connecting, _) => '~',
            (Connectivity::Disconnected, _) => 'x',
        };
        let title = format!("{} {glyph}", clock.as_deref().unwrap_or("--:--"));
        let detail = if link.buffered > 0 {
            format!("{} buffered", link.buffered)
        } else {
            "present badge".to_string()
        };
        Self::new(&title, &detail)
    }
}

/// The display panel.
pub trait Display: Send + 'static {
    /// Draw `screen`.
    ///
    /// # Errors
    ///
    /// Returns an error if the panel rejects the transfer.
    fn render(&mut self, screen: &Screen) -> Result<()>;
}

/// What one [`DisplayTask::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStep {
    /// Rendered an announcement.
    Message,
    /// Rendered a changed idle screen.
    Idle,
    /// Nothing to draw.
    Unchanged,
    /// Every sender is gone.
    Closed,
}

/// Renders announcements and the idle screen.
pub struct DisplayTask<D> {
    display: BusLock<D>,
    messages: mpsc::Receiver<DisplayMessage>,
    link: LinkStateHandle,
    clock: SyncClock,
    timezone: Tz,
    idle_after: Duration,
    lock_timeout: Duration,
    watchdog: WatchdogToken,
    last_message: Instant,
    shown: Option<Screen>,
}

impl<D: Display> DisplayTask<D> {
    /// Create the task.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        display: D,
        messages: mpsc::Receiver<DisplayMessage>,
        link: LinkStateHandle,
        clock: SyncClock,
        timezone: Tz,
        idle_after: Duration,
        lock_timeout: Duration,
        watchdog: WatchdogToken,
    ) -> Self {
        Self {
            display: BusLock::new("display", display),
            messages,
            link,
            clock,
            timezone,
            idle_after,
            lock_timeout,
            watchdog,
            last_message: Instant::now(),
            shown: None,
        }
    }

    /// Wait for one announcement or the idle tick, and draw.
    pub async fn step(&mut self) -> DisplayStep {
        self.watchdog.checkpoint();
        let tick = self.idle_after.min(Duration::from_secs(1));

        match tokio::time::timeout(tick, self.messages.recv()).await {
            Ok(Some(message)) => {
                self.last_message = Instant::now();
                self.draw(Screen::for_message(&message)).await;
                DisplayStep::Message
            }
            Ok(None) => DisplayStep::Closed,
            Err(_) if self.last_message.elapsed() >= self.idle_after => {
                let clock = self.clock.now().map(|now| {
                    now.with_timezone(&self.timezone).format("%H:%M").to_string()
                });
                let screen = Screen::idle(&self.link.snapshot(), clock);
                if self.shown.as_ref() == Some(&screen) {
                    DisplayStep::Unchanged
                } else {
                    self.draw(screen).await;
                    DisplayStep::Idle
                }
            }
            Err(_) => DisplayStep::Unchanged,
        }
    }

    /// Run until every sender is gone.
    pub async fn run(mut self) {
        while self.step().await != DisplayStep::Closed {}
        debug!("display queue closed");
    }

    async fn draw(&mut self, screen: Screen) {
        let result = match self.display.acquire(self.lock_timeout).await {
            Ok(mut panel) => panel.render(&screen),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.shown = Some(screen),
            Err(e) => warn!(error = %e, "display render failed"),
        }
    }
}
