//! Core types for session coordination
//!
//! Defines provider identity, addresses, balances, session snapshots,
//! and the pending-operation lock token.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, ErrorCode};

lazy_static::lazy_static! {
    /// Base58 address shape (no 0, O, I, l), 32-44 chars
    static ref ADDRESS_RE: Regex =
        Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("Invalid address regex");
}

/// Which credential provider an adapter represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Browser-extension signer reached through an injected host
    Extension,

    /// Passkey-style signer with a locally derived credential
    Passkey,
}

impl ProviderKind {
    /// Both providers, in conflict-resolution priority order
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Extension, ProviderKind::Passkey];

    /// The provider preferred when both report connected and none is active
    pub fn preferred() -> Self {
        ProviderKind::Extension
    }

    /// The counterpart provider
    pub fn other(&self) -> Self {
        match self {
            ProviderKind::Extension => ProviderKind::Passkey,
            ProviderKind::Passkey => ProviderKind::Extension,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Extension => write!(f, "extension"),
            ProviderKind::Passkey => write!(f, "passkey"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "extension" | "ext" => Ok(ProviderKind::Extension),
            "passkey" | "pk" => Ok(ProviderKind::Passkey),
            other => Err(Error::Config(format!("Unknown provider: {}", other))),
        }
    }
}

/// Validated wallet address (base58 string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Validate and wrap a base58 address string
    pub fn new(s: impl Into<String>) -> crate::error::Result<Self> {
        let s = s.into();
        if ADDRESS_RE.is_match(&s) {
            Ok(Address(s))
        } else {
            Err(Error::InvalidAddress(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for logs: first 4 + last 4 chars
    pub fn short(&self) -> String {
        let s = &self.0;
        if s.len() <= 8 {
            s.clone()
        } else {
            format!("{}..{}", &s[..4], &s[s.len() - 4..])
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance of one token account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    /// Token mint address
    pub mint: String,

    /// Token symbol if known
    pub symbol: Option<String>,

    /// Raw amount in base units
    pub amount: u64,

    /// Decimals for display conversion
    pub decimals: u8,
}

impl TokenBalance {
    /// Amount converted to display units
    pub fn ui_amount(&self) -> f64 {
        self.amount as f64 / 10f64.powi(self.decimals as i32)
    }
}

/// Snapshot of an address's balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BalanceSet {
    /// Native balance in lamports
    pub native_lamports: u64,

    /// Token balances
    pub tokens: Vec<TokenBalance>,

    /// True when a fetch failed and these values are the last-known ones
    pub stale: bool,

    /// When these values were last fetched successfully
    pub fetched_at: Option<DateTime<Utc>>,
}

impl BalanceSet {
    /// Native balance in SOL
    pub fn native_sol(&self) -> f64 {
        self.native_lamports as f64 / 1e9
    }

    /// Same values flagged as stale
    pub fn as_stale(&self) -> Self {
        let mut set = self.clone();
        set.stale = true;
        set
    }
}

/// Opaque payload handed to a signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Transaction id returned by a signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new(s: impl Into<String>) -> Self {
        TxId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Displayable projection of an error, carried on session snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    /// Coarse category
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,
}

impl SessionError {
    pub fn from_error(e: &Error) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Externally visible session snapshot
///
/// Written only by the orchestrator; everyone else reads clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Session {
    /// Currently authoritative provider, if any
    pub active: Option<ProviderKind>,

    /// Address of the active provider
    pub address: Option<Address>,

    /// Balances of the active address
    pub balances: BalanceSet,

    /// True while a connect attempt is in flight
    pub is_connecting: bool,

    /// Most recent surfaced failure, cleared on the next success
    pub last_error: Option<SessionError>,
}

impl Session {
    /// Check if some provider is active
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

/// Mutual-exclusion token serializing state-changing intents
///
/// At most one non-idle operation exists at any instant; intents that
/// arrive while one is outstanding are rejected, never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingOperation {
    /// No operation in flight
    #[default]
    Idle,

    /// Connecting the named provider
    Connecting(ProviderKind),

    /// Disconnecting the named provider
    Disconnecting(ProviderKind),

    /// Disconnecting both providers
    DisconnectingAll,
}

impl PendingOperation {
    pub fn is_idle(&self) -> bool {
        matches!(self, PendingOperation::Idle)
    }
}

impl std::fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingOperation::Idle => write!(f, "idle"),
            PendingOperation::Connecting(kind) => write!(f, "connecting({})", kind),
            PendingOperation::Disconnecting(kind) => write!(f, "disconnecting({})", kind),
            PendingOperation::DisconnectingAll => write!(f, "disconnecting_all"),
        }
    }
}

/// State change an adapter observed on itself outside any orchestrated call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Adapter became connected on its own timeline
    Connected(ProviderKind),

    /// Adapter became disconnected on its own timeline
    Disconnected(ProviderKind),

    /// Adapter's account switched while it stayed connected
    AddressChanged(ProviderKind),
}

impl AdapterEvent {
    /// Which adapter the event concerns
    pub fn kind(&self) -> ProviderKind {
        match self {
            AdapterEvent::Connected(kind)
            | AdapterEvent::Disconnected(kind)
            | AdapterEvent::AddressChanged(kind) => *kind,
        }
    }
}
