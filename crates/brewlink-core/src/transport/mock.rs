//! Mock serial transport for testing.
//!
//! Simulates one controller: what discovery currently sees, the lines the
//! application prints while booting, canned replies per `VERB OBJECT` and an
//! optional in-memory settings store answering `GET`/`PUT settings`.
//! Reads never block; an empty receive queue reads as a timeout.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::traits::Transport;
use crate::device::{DeviceMode, DiscoveredPort};
use crate::protocol::Request;
use crate::protocol::constants::{CMD_GET_SETTINGS, CMD_PUT_SETTINGS};

#[derive(Debug, Default)]
struct MockState {
    present: Option<DiscoveredPort>,
    after_touch: Option<DiscoveredPort>,
    boot_lines: Vec<String>,
    rx: VecDeque<String>,
    replies: HashMap<String, Vec<String>>,
    settings: Option<BTreeMap<String, String>>,
    writes: Vec<String>,
    opened: Vec<(String, u32)>,
    touches: Vec<String>,
    open: bool,
    fail_open: bool,
    /// Opens still to refuse before `open` succeeds again.
    refused_opens: usize,
}

impl MockState {
    fn answer(&mut self, line: &str) {
        let Some(request) = Request::parse(line) else {
            return;
        };

        if let Some(store) = self.settings.as_mut() {
            if line == CMD_GET_SETTINGS {
                self.rx
                    .extend(store.iter().map(|(k, v)| format!("{k}={v}")));
                self.rx.push_back(request.ok_marker().to_string());
                return;
            }
            if let Some(payload) = line
                .strip_prefix(CMD_PUT_SETTINGS)
                .and_then(|rest| rest.strip_prefix(' '))
            {
                for token in payload.split(',') {
                    if let Some((k, v)) = token.split_once('=') {
                        store.insert(k.to_string(), v.to_string());
                    }
                }
                self.rx.push_back(request.ok_marker().to_string());
                return;
            }
        }

        let key = request
            .ok_marker()
            .rsplit_once(' ')
            .map(|(head, _)| head.to_string())
            .unwrap_or_default();
        if let Some(reply) = self.replies.get(&key) {
            self.rx.extend(reply.iter().cloned());
        }
    }
}

/// Mock transport for unit testing session and orchestrator logic.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Shared view of a [`MockTransport`], usable after the transport has been
/// moved into a session.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A bus with nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Set what discovery currently finds.
    pub fn set_present(&self, port: Option<DiscoveredPort>) {
        self.state().present = port;
    }

    /// What shows up after a 1200 baud touch on the present port.
    pub fn set_after_touch(&self, port: Option<DiscoveredPort>) {
        self.state().after_touch = port;
    }

    /// Lines printed each time an application-mode port is opened.
    pub fn set_boot_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().boot_lines = lines.into_iter().map(Into::into).collect();
    }

    /// Queue an unsolicited line.
    pub fn push_line(&self, line: impl Into<String>) {
        self.state().rx.push_back(line.into());
    }

    /// Lines sent whenever a request starting with `verb_object` is written.
    pub fn set_reply<I, S>(&self, verb_object: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .replies
            .insert(verb_object.to_string(), lines.into_iter().map(Into::into).collect());
    }

    /// Serve `GET settings` / `PUT settings` from an in-memory store.
    pub fn set_settings(&self, settings: BTreeMap<String, String>) {
        self.state().settings = Some(settings);
    }

    pub fn settings(&self) -> Option<BTreeMap<String, String>> {
        self.state().settings.clone()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Refuse the next `count` opens, like a node still held by udev.
    pub fn refuse_opens(&self, count: usize) {
        self.state().refused_opens = count;
    }

    /// All lines written, in order.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Every successful open as `(port, baud)`.
    pub fn opened(&self) -> Vec<(String, u32)> {
        self.state().opened.clone()
    }

    /// Ports that received a 1200 baud touch.
    pub fn touches(&self) -> Vec<String> {
        self.state().touches.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }
}

impl Transport for MockTransport {
    fn discover(&self) -> Option<DiscoveredPort> {
        self.state().present.clone()
    }

    fn open(&mut self, port: &str, baud: u32) -> bool {
        let mut state = self.state();
        state.open = false;
        state.rx.clear();

        if state.fail_open {
            return false;
        }
        if state.refused_opens > 0 {
            state.refused_opens -= 1;
            return false;
        }
        let Some(present) = state.present.clone() else {
            return false;
        };
        if present.port != port {
            return false;
        }

        state.open = true;
        state.opened.push((port.to_string(), baud));
        if present.identity.mode == DeviceMode::Application {
            let boot = state.boot_lines.clone();
            state.rx.extend(boot);
        }
        true
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn read_line(&mut self) -> String {
        let mut state = self.state();
        if !state.open {
            return String::new();
        }
        state.rx.pop_front().unwrap_or_default()
    }

    fn read_line_until(&mut self, _deadline: Instant) -> Option<String> {
        let mut state = self.state();
        if !state.open {
            return None;
        }
        state.rx.pop_front()
    }

    fn write_line(&mut self, text: &str) {
        let mut state = self.state();
        state.writes.push(text.to_string());
        if state.open {
            state.answer(text);
        }
    }

    fn close(&mut self) {
        let mut state = self.state();
        state.open = false;
        state.rx.clear();
    }

    fn reset_to_bootloader(&mut self, port: &str) -> bool {
        let mut state = self.state();
        state.touches.push(port.to_string());
        if state.present.as_ref().is_none_or(|p| p.port != port) {
            return false;
        }
        state.present = state.after_touch.take();
        true
    }
}
