//! Video deck driven over a line protocol (`NNN text` replies, port 9993).
//!
//! Requests are queued and released one at a time: the next line goes out
//! only once the reply to the current one has arrived.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::config::{DeviceConfig, Result};
use super::state::{Activity, DeviceFacts};
use super::{
    Capability, Command, DeviceAdapter, GotoTarget, NameFormatter, NetworkSettings, StatePublisher,
};
use crate::session::{
    LineProtocolSession, LineSender, LineSettings, Response, SessionEvent, SessionObserver,
};

pub const KIND: &str = "hyperdeck";
const DEFAULT_PORT: u16 = 9993;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    host: String,
    port: u16,
    playback: bool,
}

impl Settings {
    fn parse(config: &DeviceConfig) -> Result<Self> {
        Ok(Self {
            host: config.require_str("host")?,
            port: config.port_or("port", DEFAULT_PORT)?,
            playback: config.bool_or("playback", true)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    TransportInfo,
    SlotInfo,
    Record,
    Stop,
    PreviewEnable,
    ListClips,
    SetClip,
    GotoStart,
    GotoEnd,
    Play,
}

#[derive(Debug)]
struct Protocol {
    queue: VecDeque<Action>,
    current: Option<(Action, Instant)>,
    take: String,
    play_clip: Option<String>,
    clip_id: Option<String>,
    speed: u32,
    resolution: Option<String>,
    remaining: Option<String>,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            take: String::new(),
            play_clip: None,
            clip_id: None,
            speed: 100,
            resolution: None,
            remaining: None,
        }
    }
}

impl Protocol {
    fn wire(&self, action: Action) -> Option<String> {
        Some(match action {
            Action::TransportInfo => "transport info".to_string(),
            Action::SlotInfo => "slot info".to_string(),
            Action::Record => format!("record: name: {}", self.take),
            Action::Stop => "stop".to_string(),
            Action::PreviewEnable => "preview: enable: true".to_string(),
            Action::ListClips => "clips get".to_string(),
            Action::SetClip => format!("playrange set: clip id: {}", self.clip_id.as_ref()?),
            Action::GotoStart => "goto: clip: start".to_string(),
            Action::GotoEnd => "goto: clip: end".to_string(),
            Action::Play => format!("play: loop: true speed: {}", self.speed),
        })
    }

    fn current_action(&self) -> Option<Action> {
        self.current.map(|(action, _)| action)
    }

    /// Queue actions. Returns a line to send when nothing is in flight.
    fn enqueue(&mut self, actions: &[Action]) -> Option<String> {
        self.queue.extend(actions.iter().copied());
        match self.current {
            Some((_, sent)) if sent.elapsed() < REPLY_TIMEOUT => None,
            Some((action, _)) => {
                warn!(?action, "No reply to outstanding request, moving on");
                self.advance()
            }
            None => self.advance(),
        }
    }

    fn advance(&mut self) -> Option<String> {
        while let Some(action) = self.queue.pop_front() {
            if let Some(line) = self.wire(action) {
                self.current = Some((action, Instant::now()));
                return Some(line);
            }
        }
        self.current = None;
        None
    }

    fn abort(&mut self) {
        self.queue.clear();
        self.current = None;
    }

    fn detail(&self) -> String {
        [self.resolution.as_deref(), self.remaining.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Interpret one reply. Returns the next line to send, if any.
    fn handle(&mut self, response: &Response, facts: &mut DeviceFacts) -> Option<String> {
        let Some(code) = response.code else {
            debug!(text = %response.text, "Reply without status code ignored");
            return None;
        };

        match code {
            100..=199 => self.fail(facts, response.text.trim_end_matches(':')),
            201 => self.fail(facts, "Busy"),
            209 => self.fail(facts, "No Media"),
            502 => self.fail(facts, "Bad Command"),
            202 => {
                if let Some(seconds) = response.field("recording time") {
                    self.remaining = Some(format_remaining(seconds));
                }
                facts.detail = self.detail();
                self.advance()
            }
            208 => {
                if let Some(format) = response.field("input video format") {
                    self.resolution = Some(format.to_string());
                }
                match response.field("status") {
                    Some("record") => facts.activity = Activity::Recording,
                    Some("play") => facts.activity = Activity::Playing,
                    Some(_) => facts.activity = Activity::Idle,
                    None => {}
                }
                facts.detail = self.detail();
                self.advance()
            }
            205 if self.current_action() == Some(Action::ListClips) => {
                let wanted = self.play_clip.clone().unwrap_or_default();
                match find_clip_id(&response.lines, &wanted) {
                    Some(id) => {
                        self.clip_id = Some(id);
                        self.advance()
                    }
                    None => self.fail(facts, "Clip not found"),
                }
            }
            500 => {
                // Greeting sent once per connection.
                facts.local_error = None;
                facts.activity = Activity::Idle;
                self.abort();
                self.enqueue(&[Action::TransportInfo, Action::SlotInfo])
            }
            200 => {
                facts.local_error = None;
                facts.activity = match self.current_action() {
                    Some(Action::Record) => Activity::Recording,
                    Some(Action::Play) => Activity::Playing,
                    _ => Activity::Idle,
                };
                self.advance()
            }
            _ => {
                debug!(code, text = %response.text, "Unhandled reply");
                self.advance()
            }
        }
    }

    fn fail(&mut self, facts: &mut DeviceFacts, error: &str) -> Option<String> {
        facts.local_error = Some(error.to_string());
        self.abort();
        None
    }
}

fn format_remaining(seconds: &str) -> String {
    match seconds.trim().parse::<u64>() {
        Ok(total) => format!(
            "{}:{:02}:{:02} avail",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        ),
        Err(_) => format!("{seconds} avail"),
    }
}

/// Find the id of the clip whose stem matches `wanted` in a `clips get` body:
/// `clip count: N` followed by `ID: name.mov TC TC` lines.
fn find_clip_id(lines: &[String], wanted: &str) -> Option<String> {
    let (first, rest) = lines.split_first()?;
    if !first.starts_with("clip count:") {
        return None;
    }
    rest.iter().find_map(|line| {
        let (id, remainder) = line.split_once(':')?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let name = strip_timecode(strip_timecode(remainder.trim())?)?;
        let stem = Path::new(name).file_stem()?.to_str()?;
        (stem == wanted).then(|| id.to_string())
    })
}

fn strip_timecode(s: &str) -> Option<&str> {
    let (head, last) = s.rsplit_once(char::is_whitespace)?;
    let is_timecode = last.len() == 11
        && last
            .bytes()
            .enumerate()
            .all(|(i, b)| if i % 3 == 2 { b == b':' || b == b';' } else { b.is_ascii_digit() });
    is_timecode.then(|| head.trim_end())
}

fn lock(protocol: &Mutex<Protocol>) -> MutexGuard<'_, Protocol> {
    protocol.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dispatch(sender: &LineSender, protocol: &Mutex<Protocol>, line: Option<String>) {
    let Some(line) = line else {
        return;
    };
    if let Err(err) = sender.send(&line) {
        debug!(line = %line, error = %err, "Request not sent");
        lock(protocol).abort();
    }
}

struct DeckObserver {
    protocol: Arc<Mutex<Protocol>>,
    publisher: StatePublisher,
    sender: LineSender,
}

impl SessionObserver<Response> for DeckObserver {
    fn on_event(&self, event: SessionEvent) {
        lock(&self.protocol).abort();
        self.publisher.update(|facts| facts.apply(&event));
    }

    fn on_message(&self, response: Response) {
        let next = self
            .publisher
            .update(|facts| lock(&self.protocol).handle(&response, facts));
        dispatch(&self.sender, &self.protocol, next);
    }
}

pub struct HyperDeck {
    network: NetworkSettings,
    settings: Option<Settings>,
    protocol: Arc<Mutex<Protocol>>,
    session: Option<LineProtocolSession>,
}

impl HyperDeck {
    pub fn new(network: &NetworkSettings) -> Self {
        Self {
            network: network.clone(),
            settings: None,
            protocol: Arc::new(Mutex::new(Protocol::default())),
            session: None,
        }
    }

    fn queue(&self, actions: &[Action]) {
        let line = lock(&self.protocol).enqueue(actions);
        match &self.session {
            Some(session) => dispatch(&session.sender(), &self.protocol, line),
            None => lock(&self.protocol).abort(),
        }
    }
}

#[async_trait]
impl DeviceAdapter for HyperDeck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_name(&self) -> &'static str {
        "HyperDeck"
    }

    fn capability(&self) -> Capability {
        Capability::Pollable
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        Settings::parse(config).map(|_| ())
    }

    fn configure(&mut self, config: &DeviceConfig) -> Result<()> {
        self.settings = Some(Settings::parse(config)?);
        Ok(())
    }

    fn to_config(&self) -> DeviceConfig {
        match &self.settings {
            Some(s) => DeviceConfig::new()
                .with("host", s.host.clone())
                .with("port", s.port)
                .with("playback", s.playback),
            None => DeviceConfig::new(),
        }
    }

    async fn connect(&mut self, publisher: StatePublisher) -> Result<()> {
        let settings = self
            .settings
            .clone()
            .ok_or(super::DeviceConfigError::NotConfigured)?;
        self.teardown().await;
        *lock(&self.protocol) = Protocol::default();

        let mut session = LineProtocolSession::new(LineSettings {
            host: settings.host,
            port: settings.port,
            connect_timeout: self.network.connect_timeout,
            reconnect_interval: self.network.reconnect_interval,
            teardown_wait: self.network.teardown_wait,
        });
        session.open(Arc::new(DeckObserver {
            protocol: self.protocol.clone(),
            publisher,
            sender: session.sender(),
        }));
        self.session = Some(session);
        Ok(())
    }

    async fn command(&mut self, command: &Command, formatter: &NameFormatter) {
        let playback = self.settings.as_ref().is_some_and(|s| s.playback);
        match command {
            Command::Record(take) => {
                lock(&self.protocol).take = formatter.format_take(take);
                self.queue(&[Action::TransportInfo, Action::SlotInfo, Action::Record]);
            }
            Command::Stop => {
                lock(&self.protocol).play_clip = None;
                self.queue(&[
                    Action::Stop,
                    Action::PreviewEnable,
                    Action::TransportInfo,
                    Action::SlotInfo,
                ]);
            }
            Command::Play(take) if playback => {
                {
                    let mut protocol = lock(&self.protocol);
                    protocol.play_clip = Some(formatter.format_take(take));
                    protocol.clip_id = None;
                    protocol.speed = 100;
                }
                self.queue(&[Action::ListClips, Action::SetClip, Action::GotoStart, Action::Play]);
            }
            Command::Pause(on) if playback => {
                lock(&self.protocol).speed = if *on { 0 } else { 100 };
                self.queue(&[Action::Play]);
            }
            Command::Goto(target) if playback => self.queue(&[match target {
                GotoTarget::Start => Action::GotoStart,
                GotoTarget::End => Action::GotoEnd,
            }]),
            Command::Play(_) | Command::Pause(_) | Command::Goto(_) => {
                debug!("Playback disabled, transport command ignored");
            }
            Command::Metadata(..) | Command::Unknown { .. } => {}
        }
    }

    async fn poll(&mut self) {
        self.queue(&[Action::TransportInfo, Action::SlotInfo]);
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        lock(&self.protocol).abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16, text: &str, lines: &[&str]) -> Response {
        Response {
            code: Some(code),
            text: text.to_string(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_record_sequence_is_released_one_at_a_time() {
        let mut protocol = Protocol {
            take: "sc1_t1".to_string(),
            ..Protocol::default()
        };
        let mut facts = DeviceFacts::default();

        let first = protocol.enqueue(&[Action::TransportInfo, Action::SlotInfo, Action::Record]);
        assert_eq!(first.as_deref(), Some("transport info"));
        assert_eq!(protocol.enqueue(&[]), None);

        let next = protocol.handle(
            &reply(208, "transport info:", &["status: preview", "input video format: 1080p25"]),
            &mut facts,
        );
        assert_eq!(next.as_deref(), Some("slot info"));

        let next = protocol.handle(&reply(202, "slot info:", &["recording time: 3725"]), &mut facts);
        assert_eq!(next.as_deref(), Some("record: name: sc1_t1"));
        assert_eq!(facts.detail, "1080p25 1:02:05 avail");

        assert_eq!(protocol.handle(&reply(200, "ok", &[]), &mut facts), None);
        assert_eq!(facts.activity, Activity::Recording);
        assert!(protocol.current.is_none());
    }

    #[test]
    fn test_error_codes_set_local_error_and_clear_queue() {
        let mut protocol = Protocol::default();
        let mut facts = DeviceFacts::default();
        protocol.enqueue(&[Action::Stop, Action::PreviewEnable]);

        assert_eq!(protocol.handle(&reply(209, "no media", &[]), &mut facts), None);
        assert_eq!(facts.local_error.as_deref(), Some("No Media"));
        assert!(protocol.queue.is_empty());

        protocol.enqueue(&[Action::Stop]);
        protocol.handle(&reply(200, "ok", &[]), &mut facts);
        assert_eq!(facts.local_error, None);
    }

    #[test]
    fn test_greeting_triggers_poll() {
        let mut protocol = Protocol::default();
        let mut facts = DeviceFacts::default();
        let next = protocol.handle(
            &reply(500, "connection info:", &["protocol version: 1.11"]),
            &mut facts,
        );
        assert_eq!(next.as_deref(), Some("transport info"));
    }

    #[test]
    fn test_play_resolves_clip_id() {
        let mut protocol = Protocol {
            play_clip: Some("take_02".to_string()),
            ..Protocol::default()
        };
        let mut facts = DeviceFacts::default();
        protocol.enqueue(&[Action::ListClips, Action::SetClip, Action::GotoStart, Action::Play]);

        let clips = reply(
            205,
            "clips info:",
            &[
                "clip count: 2",
                "1: take_01.mov 00:00:00:00 00:00:10:00",
                "2: take_02.mov 00:00:10:00 00:00:20:00",
            ],
        );
        let next = protocol.handle(&clips, &mut facts);
        assert_eq!(next.as_deref(), Some("playrange set: clip id: 2"));
    }

    #[test]
    fn test_missing_clip_aborts_playback() {
        let mut protocol = Protocol {
            play_clip: Some("nope".to_string()),
            ..Protocol::default()
        };
        let mut facts = DeviceFacts::default();
        protocol.enqueue(&[Action::ListClips, Action::SetClip]);
        let next = protocol.handle(&reply(205, "clips info:", &["clip count: 0"]), &mut facts);
        assert_eq!(next, None);
        assert_eq!(facts.local_error.as_deref(), Some("Clip not found"));
    }

    #[test]
    fn test_settings_defaults_and_required_host() {
        let settings = Settings::parse(&DeviceConfig::new().with("host", "10.0.0.9")).unwrap();
        assert_eq!(settings.port, 9993);
        assert!(settings.playback);
        assert!(Settings::parse(&DeviceConfig::new()).is_err());
    }
}
