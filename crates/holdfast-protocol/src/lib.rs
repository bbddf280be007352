//! # Holdfast Protocol
//!
//! Wire types of the Holdfast control channel.
//!
//! The channel carries one JSON document per line in each direction:
//!
//! - operator → agent: a [`Request`], i.e. a [`Command`] tagged by its
//!   `"command"` field plus an optional correlation `requestId`
//! - agent → operator: a [`Reply`] for every request (`"status"` is `"ok"` or
//!   `"error"`), interleaved with pushed [`EventMessage`]s (tagged by `"type"`)
//!
//! ```rust
//! use holdfast_protocol::{Command, Request, WireAddress};
//!
//! let request: Request = serde_json::from_str(r#"{"requestId": 7, "command": "read", "address": "0x1000"}"#)?;
//! assert_eq!(request.request_id, Some(7));
//! assert_eq!(
//!     request.command,
//!     Command::Read {
//!         address: WireAddress::Text("0x1000".to_string()),
//!         width: 4,
//!         signed: false,
//!     }
//! );
//! # Ok::<(), serde_json::Error>(())
//! ```
//!
//! This crate holds no behaviour; addresses, values and modes stay in their
//! wire shape until the agent side parses them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Width used by `read`, `write` and `firstScan` when none is given.
pub const DEFAULT_WIDTH: usize = 4;
/// Bytes read by `readString` when no `maxLength` is given.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 256;

const fn default_width() -> usize
{
    DEFAULT_WIDTH
}

const fn default_max_length() -> usize
{
    DEFAULT_MAX_STRING_LENGTH
}

const fn default_page() -> usize
{
    1
}

const fn default_size() -> usize
{
    1
}

/// An address as sent by the operator: a JSON number or a string
/// (`"0x7ff0"` or decimal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireAddress
{
    /// JSON number
    Number(u64),
    /// Hex or decimal string
    Text(String),
}

impl From<u64> for WireAddress
{
    fn from(value: u64) -> Self
    {
        WireAddress::Number(value)
    }
}

/// A numeric value as sent by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireScalar
{
    /// Non-negative JSON number
    Unsigned(u64),
    /// Negative JSON number
    Signed(i64),
    /// Hex or decimal string
    Text(String),
}

/// A register value as sent by the operator. Which shape is accepted depends
/// on the register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRegisterValue
{
    /// Numeric registers
    Number(u64),
    /// Pointer-sized registers
    Text(String),
    /// Vector registers, 16 bytes little-endian
    Bytes(Vec<u8>),
}

/// One code-writer call in a `patch` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePatchOperation
{
    /// Writer method, e.g. `putNop`
    pub method: String,
    /// Arguments in call order
    #[serde(default)]
    pub values: Vec<Value>,
}

/// Hook body attached by `intercept`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInjection
{
    /// Code run on every hit
    pub code: String,
}

/// Operator command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command
{
    /// Liveness check
    Ping,
    /// Write a message to the agent log
    Log
    {
        /// Message text
        message: String,
    },

    // Memory
    /// Read a scalar
    Read
    {
        /// Address to read
        address: WireAddress,
        /// Bytes: 1, 2, 4 or 8
        #[serde(default = "default_width")]
        width: usize,
        /// Interpret as two's complement
        #[serde(default)]
        signed: bool,
    },
    /// Write a scalar
    Write
    {
        /// Address to write
        address: WireAddress,
        /// Value, truncated to `width`
        value: WireScalar,
        /// Bytes: 1, 2, 4 or 8
        #[serde(default = "default_width")]
        width: usize,
        /// Interpret `value` as two's complement
        #[serde(default)]
        signed: bool,
    },
    /// Read a NUL-terminated UTF-8 string
    ReadString
    {
        /// Address of the first byte
        address: WireAddress,
        /// Upper bound on bytes read
        #[serde(default = "default_max_length")]
        max_length: usize,
    },
    /// Write a string followed by a NUL
    WriteString
    {
        /// Address of the first byte
        address: WireAddress,
        /// Text to write
        value: String,
    },
    /// Read raw bytes
    ReadBytes
    {
        /// Address of the first byte
        address: WireAddress,
        /// Number of bytes
        length: usize,
    },
    /// Write raw bytes
    WriteBytes
    {
        /// Address of the first byte
        address: WireAddress,
        /// Bytes to write
        bytes: Vec<u8>,
    },
    /// Canonical hexdump
    Hexdump
    {
        /// Address of the first byte
        address: WireAddress,
        /// Number of bytes
        length: usize,
    },
    /// File-backed executable ranges
    GetMemoryMaps,

    // Stoppoints and pause control
    /// Arm a breakpoint (`x`) or watchpoint (`r`, `w`, `rw`)
    AddStoppoint
    {
        /// Address to watch or break on
        address: WireAddress,
        /// `r`, `w`, `rw` or `x`
        mode: String,
        /// Watched bytes; ignored for breakpoints
        #[serde(default = "default_size")]
        size: usize,
    },
    /// Disarm a stoppoint
    RemoveStoppoint
    {
        /// Address it was armed on
        address: WireAddress,
        /// Mode it was armed with
        mode: String,
    },
    /// Every armed stoppoint
    ListStoppoints,
    /// Release the paused thread
    Resume,
    /// Read a register of the paused thread
    ReadRegister
    {
        /// Register name, e.g. `x0`, `rip`, `q3`
        id: String,
    },
    /// Write a register of the paused thread
    WriteRegister
    {
        /// Register name
        id: String,
        /// New value
        value: WireRegisterValue,
    },

    // Freezing
    /// Pin the current 4-byte value at an address
    Freeze
    {
        /// Address to pin
        address: WireAddress,
    },
    /// Stop pinning an address
    Unfreeze
    {
        /// Pinned address
        address: WireAddress,
    },
    /// Replace the value pinned at an address
    UpdateFrozenValue
    {
        /// Pinned address
        address: WireAddress,
        /// New value
        value: WireScalar,
    },
    /// Every pinned value
    ListFrozen,

    // Scanning
    /// Start a scan session
    FirstScan
    {
        /// Value to look for
        target_value: WireScalar,
        /// Bytes: 1, 2, 4 or 8
        #[serde(default = "default_width")]
        width: usize,
        /// Compare as two's complement
        #[serde(default)]
        signed: bool,
    },
    /// Narrow the scan session
    NextScan
    {
        /// Value the candidates must now hold
        target_value: WireScalar,
    },
    /// Discard the scan session
    ClearScanState,
    /// One page of candidates with their current values
    GetScanResults
    {
        /// 1-based page
        #[serde(default = "default_page")]
        page: usize,
        /// Results per page; the agent default when absent
        #[serde(default)]
        page_size: Option<usize>,
    },
    /// One-shot string search
    ScanStrings
    {
        /// Text to search for
        target_value: String,
        /// Restrict the search to these addresses
        #[serde(default)]
        addresses: Option<Vec<WireAddress>>,
    },

    // Code
    /// Disassemble consecutive instructions
    Disassemble
    {
        /// First instruction
        address: WireAddress,
        /// Number of instructions
        count: usize,
    },
    /// Rewrite code through the code writer
    Patch
    {
        /// Patch site
        address: WireAddress,
        /// Writer calls in order
        operations: Vec<WirePatchOperation>,
    },
    /// Attach a hook, replacing any at the same address
    Intercept
    {
        /// Hooked address
        address: WireAddress,
        /// Hook body
        code_injection: CodeInjection,
    },
    /// Detach the hook at an address
    DetachInterception
    {
        /// Hooked address
        address: WireAddress,
    },
    /// Detach every hook
    DetachAllInterceptors,

    /// Drive a trap through the agent from a simulated target thread.
    ///
    /// Only honoured by the emulated target.
    RaiseTrap
    {
        /// `breakpoint`, `singleStep`, `accessViolation` or `unknown`
        kind: String,
        /// Address of the trapping instruction
        address: WireAddress,
        /// Trapping thread; the control thread when absent
        #[serde(default)]
        thread: Option<u64>,
    },
}

impl Command
{
    /// Wire name of the command, as found in its `"command"` field.
    #[must_use]
    pub const fn name(&self) -> &'static str
    {
        match self {
            Command::Ping => "ping",
            Command::Log { .. } => "log",
            Command::Read { .. } => "read",
            Command::Write { .. } => "write",
            Command::ReadString { .. } => "readString",
            Command::WriteString { .. } => "writeString",
            Command::ReadBytes { .. } => "readBytes",
            Command::WriteBytes { .. } => "writeBytes",
            Command::Hexdump { .. } => "hexdump",
            Command::GetMemoryMaps => "getMemoryMaps",
            Command::AddStoppoint { .. } => "addStoppoint",
            Command::RemoveStoppoint { .. } => "removeStoppoint",
            Command::ListStoppoints => "listStoppoints",
            Command::Resume => "resume",
            Command::ReadRegister { .. } => "readRegister",
            Command::WriteRegister { .. } => "writeRegister",
            Command::Freeze { .. } => "freeze",
            Command::Unfreeze { .. } => "unfreeze",
            Command::UpdateFrozenValue { .. } => "updateFrozenValue",
            Command::ListFrozen => "listFrozen",
            Command::FirstScan { .. } => "firstScan",
            Command::NextScan { .. } => "nextScan",
            Command::ClearScanState => "clearScanState",
            Command::GetScanResults { .. } => "getScanResults",
            Command::ScanStrings { .. } => "scanStrings",
            Command::Disassemble { .. } => "disassemble",
            Command::Patch { .. } => "patch",
            Command::Intercept { .. } => "intercept",
            Command::DetachInterception { .. } => "detachInterception",
            Command::DetachAllInterceptors => "detachAllInterceptors",
            Command::RaiseTrap { .. } => "raiseTrap",
        }
    }
}

/// A command with an optional correlation id, echoed in its [`Reply`].
///
/// The id travels as `requestId`; `id` belongs to the register commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request
{
    /// Correlation id
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// The command itself
    #[serde(flatten)]
    pub command: Command,
}

impl From<Command> for Request
{
    fn from(command: Command) -> Self
    {
        Self {
            request_id: None,
            command,
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus
{
    /// The command succeeded; see [`Reply::result`]
    Ok,
    /// The command failed; see [`Reply::error`] and [`Reply::kind`]
    Error,
}

/// Answer to exactly one [`Request`].
///
/// ```rust
/// use holdfast_protocol::Reply;
///
/// let reply = Reply::error(None, "no free watchpoint slot", "ResourceExhausted");
/// assert_eq!(
///     serde_json::to_string(&reply)?,
///     r#"{"status":"error","error":"no free watchpoint slot","kind":"ResourceExhausted"}"#
/// );
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply
{
    /// Correlation id of the request
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// Success or failure
    pub status: ReplyStatus,
    /// Command result (`null` for commands with nothing to return)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error taxonomy name, e.g. `NotFound`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Reply
{
    /// Successful reply carrying `result`.
    #[must_use]
    pub fn ok(request_id: Option<u64>, result: Value) -> Self
    {
        Self {
            request_id,
            status: ReplyStatus::Ok,
            result: Some(result),
            error: None,
            kind: None,
        }
    }

    /// Failed reply.
    #[must_use]
    pub fn error(request_id: Option<u64>, error: impl Into<String>, kind: impl Into<String>) -> Self
    {
        Self {
            request_id,
            status: ReplyStatus::Error,
            result: None,
            error: Some(error.into()),
            kind: Some(kind.into()),
        }
    }

    /// `true` for [`ReplyStatus::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool
    {
        self.status == ReplyStatus::Ok
    }
}

/// Event pushed to the operator when a stoppoint pauses the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum EventMessage
{
    /// Execution reached a breakpoint
    Breakpoint
    {
        /// Breakpoint address, `0x`-prefixed hex
        address: String,
        /// Slot it occupied
        slot: usize,
    },
    /// A watched address was accessed
    Watchpoint
    {
        /// Effective address of the access
        address: String,
        /// `r`, `w` or `rw`
        operation: String,
        /// Watched bytes
        size: usize,
        /// Slot it occupies
        slot: usize,
        /// Address of the accessing instruction
        program_counter: String,
    },
}

#[cfg(test)]
mod tests
{
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> Command
    {
        serde_json::from_value::<Request>(value).unwrap().command
    }

    #[test]
    fn test_defaults_are_applied()
    {
        assert_eq!(
            parse(json!({"command": "write", "address": 4096, "value": -3})),
            Command::Write {
                address: WireAddress::Number(4096),
                value: WireScalar::Signed(-3),
                width: 4,
                signed: false,
            }
        );
        assert_eq!(
            parse(json!({"command": "readString", "address": "0x10"})),
            Command::ReadString {
                address: WireAddress::Text("0x10".to_string()),
                max_length: 256,
            }
        );
        assert_eq!(
            parse(json!({"command": "getScanResults"})),
            Command::GetScanResults { page: 1, page_size: None }
        );
        assert_eq!(
            parse(json!({"command": "addStoppoint", "address": "0x40", "mode": "x"})),
            Command::AddStoppoint {
                address: WireAddress::Text("0x40".to_string()),
                mode: "x".to_string(),
                size: 1,
            }
        );
    }

    #[test]
    fn test_camel_case_fields()
    {
        assert_eq!(
            parse(json!({"command": "firstScan", "targetValue": 100, "width": 2, "signed": true})),
            Command::FirstScan {
                target_value: WireScalar::Unsigned(100),
                width: 2,
                signed: true,
            }
        );
        assert_eq!(
            parse(json!({"command": "getScanResults", "page": 3, "pageSize": 25})),
            Command::GetScanResults {
                page: 3,
                page_size: Some(25),
            }
        );
        assert_eq!(
            parse(json!({"command": "intercept", "address": 1, "codeInjection": {"code": "hit()"}})),
            Command::Intercept {
                address: WireAddress::Number(1),
                code_injection: CodeInjection {
                    code: "hit()".to_string()
                },
            }
        );
    }

    #[test]
    fn test_register_value_shapes()
    {
        let values: Vec<WireRegisterValue> = serde_json::from_value(json!([42, "0x7ff0", [1, 2, 3]])).unwrap();
        assert_eq!(
            values,
            vec![
                WireRegisterValue::Number(42),
                WireRegisterValue::Text("0x7ff0".to_string()),
                WireRegisterValue::Bytes(vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn test_unknown_command_is_rejected()
    {
        assert!(serde_json::from_value::<Request>(json!({"command": "launch"})).is_err());
        assert!(serde_json::from_value::<Request>(json!({"address": "0x10"})).is_err());
        assert!(serde_json::from_value::<Request>(json!({"command": "read"})).is_err());
    }

    #[test]
    fn test_command_names_match_tags()
    {
        for command in [
            Command::Ping,
            Command::ListFrozen,
            Command::ClearScanState,
            Command::GetScanResults { page: 1, page_size: None },
            Command::UpdateFrozenValue {
                address: WireAddress::Number(0),
                value: WireScalar::Unsigned(1),
            },
            Command::RaiseTrap {
                kind: "breakpoint".to_string(),
                address: WireAddress::Number(0),
                thread: None,
            },
        ] {
            let value = serde_json::to_value(&command).unwrap();
            assert_eq!(value["command"], command.name());
        }
    }

    #[test]
    fn test_request_id_round_trip()
    {
        let request: Request = serde_json::from_value(json!({"requestId": 3, "command": "ping"})).unwrap();
        assert_eq!(request.request_id, Some(3));
        assert_eq!(request.command, Command::Ping);

        let reply = Reply::ok(request.request_id, json!(true));
        assert!(reply.is_ok());
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"requestId": 3, "status": "ok", "result": true})
        );
    }

    #[test]
    fn test_register_id_is_not_the_request_id()
    {
        let read_pc = Command::ReadRegister { id: "pc".to_string() };

        let request: Request = serde_json::from_value(json!({"command": "readRegister", "id": "pc"})).unwrap();
        assert_eq!(request.request_id, None);
        assert_eq!(request.command, read_pc);

        let request: Request =
            serde_json::from_value(json!({"requestId": 12, "command": "readRegister", "id": "pc"})).unwrap();
        assert_eq!(request.request_id, Some(12));
        assert_eq!(request.command, read_pc);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"requestId": 12, "command": "readRegister", "id": "pc"})
        );

        let request: Request = serde_json::from_value(json!({
            "requestId": 13,
            "command": "writeRegister",
            "id": "x0",
            "value": 5,
        }))
        .unwrap();
        assert_eq!(request.request_id, Some(13));
        assert_eq!(
            request.command,
            Command::WriteRegister {
                id: "x0".to_string(),
                value: WireRegisterValue::Number(5),
            }
        );
    }

    #[test]
    fn test_event_wire_format()
    {
        let event = EventMessage::Watchpoint {
            address: "0x10010".to_string(),
            operation: "w".to_string(),
            size: 4,
            slot: 0,
            program_counter: "0x40010".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "watchpoint",
                "address": "0x10010",
                "operation": "w",
                "size": 4,
                "slot": 0,
                "programCounter": "0x40010",
            })
        );

        let event = EventMessage::Breakpoint {
            address: "0x40000".to_string(),
            slot: 1,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "breakpoint", "address": "0x40000", "slot": 1})
        );
    }
}
