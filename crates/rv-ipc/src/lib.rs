//! Messaging between the background context, page contexts and the settings
//! surface.
//!
//! Messages travel as JSON objects (`{"action":"updateHighlight"}`) inside
//! length-prefixed frames. Delivery is fire-and-forget: a missing or unloaded
//! receiver is an error for the sender to log, never a reason to stop.

use rv_core::RevisitError;
use rv_core::RevisitResult;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::mpsc;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
const HARD_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
const FRAME_PREFIX_BYTES: usize = 4;

/// Execution contexts that exchange messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Background,
    Page,
}

impl ContextRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Page => "page",
        }
    }
}

/// Fire-and-forget extension message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ExtensionMessage {
    /// Settings changed; page contexts should recompute.
    UpdateSettings,
    /// Stored history changed; the receiving page should recompute.
    UpdateHighlight,
    /// Settings surface asks the background to re-run the history backfill.
    ReloadHistory,
    /// Background reports a finished reload.
    ReloadDone,
}

impl ExtensionMessage {
    pub fn action(self) -> &'static str {
        match self {
            Self::UpdateSettings => "updateSettings",
            Self::UpdateHighlight => "updateHighlight",
            Self::ReloadHistory => "reloadHistory",
            Self::ReloadDone => "reloadDone",
        }
    }
}

/// Defines how contexts communicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub role: ContextRole,
    pub max_message_bytes: usize,
}

impl ChannelConfig {
    pub fn hardened(role: ContextRole) -> RevisitResult<Self> {
        let config = Self {
            role,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RevisitResult<()> {
        if self.max_message_bytes == 0 {
            return Err(RevisitError::new(
                "ipc.max_message_bytes_invalid",
                "channel max_message_bytes must be greater than zero",
            ));
        }

        if self.max_message_bytes > HARD_MAX_MESSAGE_BYTES {
            return Err(RevisitError::new(
                "ipc.max_message_bytes_too_large",
                "channel max_message_bytes exceeds hard limit (16 MiB)",
            ));
        }

        Ok(())
    }
}

/// In-memory endpoint that applies framing and message-size checks.
#[derive(Debug)]
pub struct LocalEndpoint {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    config: ChannelConfig,
}

impl LocalEndpoint {
    fn send(&self, payload: &[u8]) -> RevisitResult<()> {
        let frame = encode_frame(payload, self.config.max_message_bytes)?;
        self.tx.send(frame).map_err(|error| {
            RevisitError::new(
                "ipc.send_failed",
                format!(
                    "failed to send message from {} endpoint: {error}",
                    self.config.role.as_str()
                ),
            )
        })
    }

    pub fn send_message(&self, message: &ExtensionMessage) -> RevisitResult<()> {
        self.send(&encode_message_payload(message)?)
    }

    /// Next pending message, if any, without blocking.
    pub fn try_recv_message(&self) -> RevisitResult<Option<ExtensionMessage>> {
        match self.rx.try_recv() {
            Ok(frame) => {
                let payload = decode_frame(&frame, self.config.max_message_bytes)?;
                decode_message_payload(&payload).map(Some)
            }
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(RevisitError::new(
                "ipc.peer_disconnected",
                format!(
                    "peer of {} endpoint disconnected",
                    self.config.role.as_str()
                ),
            )),
        }
    }
}

/// Creates paired in-memory endpoints.
pub fn local_channel_pair(
    left: ChannelConfig,
    right: ChannelConfig,
) -> RevisitResult<(LocalEndpoint, LocalEndpoint)> {
    left.validate()?;
    right.validate()?;

    let (left_to_right_tx, left_to_right_rx) = mpsc::channel();
    let (right_to_left_tx, right_to_left_rx) = mpsc::channel();

    Ok((
        LocalEndpoint {
            tx: left_to_right_tx,
            rx: right_to_left_rx,
            config: left,
        },
        LocalEndpoint {
            tx: right_to_left_tx,
            rx: left_to_right_rx,
            config: right,
        },
    ))
}

/// Encodes a payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_message_bytes: usize) -> RevisitResult<Vec<u8>> {
    if payload.len() > max_message_bytes {
        return Err(RevisitError::new(
            "ipc.message_too_large",
            format!(
                "payload exceeds max_message_bytes ({} > {})",
                payload.len(),
                max_message_bytes
            ),
        ));
    }

    let len_u32 = u32::try_from(payload.len()).map_err(|_| {
        RevisitError::new(
            "ipc.message_too_large",
            "payload length does not fit in 32-bit frame prefix",
        )
    })?;

    let mut out = Vec::with_capacity(FRAME_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&len_u32.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes a length-prefixed frame and validates payload size.
pub fn decode_frame(frame: &[u8], max_message_bytes: usize) -> RevisitResult<Vec<u8>> {
    let Some((prefix, payload)) = frame.split_first_chunk::<FRAME_PREFIX_BYTES>() else {
        return Err(RevisitError::new(
            "ipc.frame_too_short",
            "frame is shorter than the 4-byte length prefix",
        ));
    };

    let payload_len = u32::from_be_bytes(*prefix) as usize;
    if payload_len > max_message_bytes {
        return Err(RevisitError::new(
            "ipc.message_too_large",
            format!(
                "decoded payload exceeds max_message_bytes ({} > {})",
                payload_len, max_message_bytes
            ),
        ));
    }

    if payload.len() != payload_len {
        return Err(RevisitError::new(
            "ipc.frame_length_mismatch",
            format!(
                "frame length mismatch: expected {payload_len} payload bytes, got {}",
                payload.len()
            ),
        ));
    }

    Ok(payload.to_vec())
}

fn encode_message_payload(message: &ExtensionMessage) -> RevisitResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|error| {
        RevisitError::new(
            "ipc.message_encode_failed",
            format!("failed to encode `{}` message: {error}", message.action()),
        )
    })
}

fn decode_message_payload(payload: &[u8]) -> RevisitResult<ExtensionMessage> {
    if payload.is_empty() {
        return Err(RevisitError::new(
            "ipc.message_empty",
            "typed message payload is empty",
        ));
    }

    serde_json::from_slice(payload).map_err(|error| {
        RevisitError::new(
            "ipc.message_invalid",
            format!("payload is not a known extension message: {error}"),
        )
    })
}

/// Browser tab identifier.
pub type TabId = u64;

/// What the background knows about an open tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub active: bool,
}

/// Delivers messages to page contexts and to the runtime listeners
/// (settings surface).
pub trait TabMessenger: Send + Sync {
    fn query_tabs(&self) -> RevisitResult<Vec<TabInfo>>;

    fn send_to_tab(&self, tab: TabId, message: &ExtensionMessage) -> RevisitResult<()>;

    fn send_runtime(&self, message: &ExtensionMessage) -> RevisitResult<()>;

    /// Active tab of the current window.
    fn active_tab(&self) -> RevisitResult<Option<TabInfo>> {
        Ok(self.query_tabs()?.into_iter().find(|tab| tab.active))
    }
}

/// Makes sure the page-context engine is running in a tab before it is
/// messaged.
pub trait ScriptInjector: Send + Sync {
    fn ensure_injected(&self, tab: TabId) -> RevisitResult<()>;
}

/// Injector for hosts whose page contexts carry the engine from creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreloadedEngine;

impl ScriptInjector for PreloadedEngine {
    fn ensure_injected(&self, _tab: TabId) -> RevisitResult<()> {
        Ok(())
    }
}

struct AttachedTab {
    info: TabInfo,
    endpoint: LocalEndpoint,
}

/// [`TabMessenger`] over in-process channels, one per attached page context.
#[derive(Default)]
pub struct ChannelTabMessenger {
    tabs: Mutex<BTreeMap<TabId, AttachedTab>>,
    runtime: Mutex<Vec<ExtensionMessage>>,
}

impl ChannelTabMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the background end of a page's channel.
    pub fn attach(&self, info: TabInfo, endpoint: LocalEndpoint) -> RevisitResult<()> {
        let mut tabs = self.lock_tabs()?;
        if info.active {
            for tab in tabs.values_mut() {
                tab.info.active = false;
            }
        }
        tabs.insert(info.id, AttachedTab { info, endpoint });
        Ok(())
    }

    pub fn detach(&self, tab: TabId) -> RevisitResult<()> {
        self.lock_tabs()?.remove(&tab);
        Ok(())
    }

    /// Runtime messages sent so far, oldest first; the log is cleared.
    pub fn drain_runtime(&self) -> RevisitResult<Vec<ExtensionMessage>> {
        let mut runtime = self.lock_runtime()?;
        Ok(std::mem::take(&mut *runtime))
    }

    fn lock_tabs(&self) -> RevisitResult<MutexGuard<'_, BTreeMap<TabId, AttachedTab>>> {
        self.tabs
            .lock()
            .map_err(|_| RevisitError::new("ipc.lock_poisoned", "tab registry lock poisoned"))
    }

    fn lock_runtime(&self) -> RevisitResult<MutexGuard<'_, Vec<ExtensionMessage>>> {
        self.runtime
            .lock()
            .map_err(|_| RevisitError::new("ipc.lock_poisoned", "runtime log lock poisoned"))
    }
}

impl TabMessenger for ChannelTabMessenger {
    fn query_tabs(&self) -> RevisitResult<Vec<TabInfo>> {
        Ok(self
            .lock_tabs()?
            .values()
            .map(|tab| tab.info.clone())
            .collect())
    }

    fn send_to_tab(&self, tab: TabId, message: &ExtensionMessage) -> RevisitResult<()> {
        let tabs = self.lock_tabs()?;
        let attached = tabs.get(&tab).ok_or_else(|| {
            RevisitError::new(
                "ipc.receiver_missing",
                format!("no page context attached for tab {tab}"),
            )
        })?;
        attached.endpoint.send_message(message)
    }

    fn send_runtime(&self, message: &ExtensionMessage) -> RevisitResult<()> {
        self.lock_runtime()?.push(*message);
        Ok(())
    }
}
