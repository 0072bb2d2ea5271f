use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::RawEnvelope;

pub const PROTOCOL_VERSION: i64 = 1;

pub const ARG_BLOCK: &str = "block";
pub const ARG_TIMEOUT: &str = "timeout";
pub const ARG_MAX_SIZE: &str = "max_size";

const FIELD_VERSION: &str = "v";
const FIELD_COMMAND: &str = "cmd";
const FIELD_ARGS: &str = "args";
const FIELD_DATA: &str = "data";
const FIELD_STATUS: &str = "st";
const FIELD_REASON: &str = "reason";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Put,
    Get,
    Ping,
    QueryStatus,
    Size,
    MaxSize,
    Reset,
    Clients,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Self::Put,
        Self::Get,
        Self::Ping,
        Self::QueryStatus,
        Self::Size,
        Self::MaxSize,
        Self::Reset,
        Self::Clients,
    ];

    pub fn opcode(self) -> i64 {
        match self {
            Self::Put => 1,
            Self::Get => 2,
            Self::Ping => 3,
            Self::QueryStatus => 4,
            Self::Size => 5,
            Self::MaxSize => 6,
            Self::Reset => 7,
            Self::Clients => 8,
        }
    }

    pub fn from_opcode(opcode: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.opcode() == opcode)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Get => "GET",
            Self::Ping => "PING",
            Self::QueryStatus => "QUERY_STATUS",
            Self::Size => "SIZE",
            Self::MaxSize => "MAXSIZE",
            Self::Reset => "RESET",
            Self::Clients => "CLIENTS",
        }
    }

    fn allowed_args(self) -> &'static [&'static str] {
        match self {
            Self::Put | Self::Get => &[ARG_BLOCK, ARG_TIMEOUT],
            Self::Reset => &[ARG_MAX_SIZE],
            Self::Ping | Self::QueryStatus | Self::Size | Self::MaxSize | Self::Clients => &[],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A primitive argument value. `Null` stands for an argument that is present
/// but unset, e.g. `timeout = nil` meaning "wait forever".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
}

impl ArgValue {
    fn to_value(self) -> Value {
        match self {
            Self::Null => Value::Nil,
            Self::Bool(flag) => Value::Boolean(flag),
            Self::Int(number) => Value::Integer(number.into()),
        }
    }

    fn from_value(key: &str, value: &Value) -> Result<Self, MessageError> {
        match value {
            Value::Nil => Ok(Self::Null),
            Value::Boolean(flag) => Ok(Self::Bool(*flag)),
            Value::Integer(number) => number
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| MessageError::IntegerOutOfRange {
                    field: key.to_owned(),
                }),
            _ => Err(MessageError::InvalidArgumentType {
                key: key.to_owned(),
                expected: "nil, bool or int",
            }),
        }
    }
}

pub type Arguments = BTreeMap<String, ArgValue>;

#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    IntegerOutOfRange { field: String },
    UnknownCommand { opcode: i64 },
    UnknownStatus { code: i64 },
    ArgumentKeyMustBeUtf8String,
    DuplicateArgument { key: String },
    InvalidArgumentType { key: String, expected: &'static str },
    UnexpectedArgument { command: Command, key: String },
    MissingArgument { command: Command, key: &'static str },
    MissingPayload { command: Command },
    UnexpectedPayload { command: Command },
    NegativeCount { value: i64 },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::UnknownCommand { opcode } => write!(f, "unknown command opcode {opcode}"),
            Self::UnknownStatus { code } => write!(f, "unknown reply status {code}"),
            Self::ArgumentKeyMustBeUtf8String => {
                write!(f, "argument keys must be UTF-8 strings")
            }
            Self::DuplicateArgument { key } => write!(f, "argument '{key}' is given more than once"),
            Self::InvalidArgumentType { key, expected } => {
                write!(f, "argument '{key}' has invalid type, expected {expected}")
            }
            Self::UnexpectedArgument { command, key } => {
                write!(f, "{command} does not take argument '{key}'")
            }
            Self::MissingArgument { command, key } => {
                write!(f, "{command} requires argument '{key}'")
            }
            Self::MissingPayload { command } => write!(f, "{command} requires a data payload"),
            Self::UnexpectedPayload { command } => {
                write!(f, "{command} does not carry a data payload")
            }
            Self::NegativeCount { value } => {
                write!(f, "count reply must be non-negative, got {value}")
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// A client-to-server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub args: Arguments,
    pub payload: Option<Vec<u8>>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            args: Arguments::new(),
            payload: None,
        }
    }

    pub fn with_arg(mut self, key: &str, value: ArgValue) -> Self {
        self.args.insert(key.to_owned(), value);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn put(item: Vec<u8>, block: bool, timeout_ms: Option<i64>) -> Self {
        Self::new(Command::Put)
            .with_arg(ARG_BLOCK, ArgValue::Bool(block))
            .with_arg(ARG_TIMEOUT, timeout_ms.map_or(ArgValue::Null, ArgValue::Int))
            .with_payload(item)
    }

    pub fn get(block: bool, timeout_ms: Option<i64>) -> Self {
        Self::new(Command::Get)
            .with_arg(ARG_BLOCK, ArgValue::Bool(block))
            .with_arg(ARG_TIMEOUT, timeout_ms.map_or(ArgValue::Null, ArgValue::Int))
    }

    pub fn reset(max_size: i64) -> Self {
        Self::new(Command::Reset).with_arg(ARG_MAX_SIZE, ArgValue::Int(max_size))
    }

    /// `block` argument; absent or nil means blocking.
    pub fn block(&self) -> bool {
        match self.args.get(ARG_BLOCK) {
            Some(ArgValue::Bool(flag)) => *flag,
            _ => true,
        }
    }

    /// `timeout` argument in milliseconds; absent or nil means no timeout.
    pub fn timeout_ms(&self) -> Option<i64> {
        match self.args.get(ARG_TIMEOUT) {
            Some(ArgValue::Int(ms)) => Some(*ms),
            _ => None,
        }
    }

    pub fn max_size(&self) -> Option<i64> {
        match self.args.get(ARG_MAX_SIZE) {
            Some(ArgValue::Int(size)) => Some(*size),
            _ => None,
        }
    }

    pub fn from_raw(raw: &RawEnvelope) -> Result<Self, MessageError> {
        check_version(raw)?;

        let opcode = parse_i64(raw.get(FIELD_COMMAND), FIELD_COMMAND)?;
        let command =
            Command::from_opcode(opcode).ok_or(MessageError::UnknownCommand { opcode })?;
        let args = parse_arguments(raw.get(FIELD_ARGS))?;
        let payload = match raw.get(FIELD_DATA) {
            None | Some(Value::Nil) => None,
            Some(Value::Binary(bytes)) => Some(bytes.clone()),
            Some(_) => {
                return Err(MessageError::InvalidFieldType {
                    field: FIELD_DATA,
                    expected: "binary",
                })
            }
        };

        let request = Self {
            command,
            args,
            payload,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn into_raw(self) -> RawEnvelope {
        let mut raw = RawEnvelope::new();
        raw.insert(FIELD_VERSION.to_owned(), Value::Integer(PROTOCOL_VERSION.into()));
        raw.insert(
            FIELD_COMMAND.to_owned(),
            Value::Integer(self.command.opcode().into()),
        );

        let args = self
            .args
            .into_iter()
            .map(|(key, value)| (Value::String(key.into()), value.to_value()))
            .collect::<Vec<_>>();
        raw.insert(FIELD_ARGS.to_owned(), Value::Map(args));

        if let Some(payload) = self.payload {
            raw.insert(FIELD_DATA.to_owned(), Value::Binary(payload));
        }

        raw
    }

    /// Checks argument names, argument types and payload presence against the
    /// command.
    pub fn validate(&self) -> Result<(), MessageError> {
        let allowed = self.command.allowed_args();
        for (key, value) in &self.args {
            if !allowed.contains(&key.as_str()) {
                return Err(MessageError::UnexpectedArgument {
                    command: self.command,
                    key: key.clone(),
                });
            }

            let type_ok = match key.as_str() {
                ARG_BLOCK => matches!(value, ArgValue::Bool(_) | ArgValue::Null),
                ARG_TIMEOUT => matches!(value, ArgValue::Int(_) | ArgValue::Null),
                ARG_MAX_SIZE => matches!(value, ArgValue::Int(_)),
                _ => false,
            };
            if !type_ok {
                return Err(MessageError::InvalidArgumentType {
                    key: key.clone(),
                    expected: expected_arg_type(key),
                });
            }
        }

        if self.command == Command::Reset && !self.args.contains_key(ARG_MAX_SIZE) {
            return Err(MessageError::MissingArgument {
                command: self.command,
                key: ARG_MAX_SIZE,
            });
        }

        match (self.command, &self.payload) {
            (Command::Put, None) => Err(MessageError::MissingPayload {
                command: self.command,
            }),
            (Command::Put, Some(_)) | (_, None) => Ok(()),
            (command, Some(_)) => Err(MessageError::UnexpectedPayload { command }),
        }
    }
}

fn expected_arg_type(key: &str) -> &'static str {
    match key {
        ARG_BLOCK => "bool",
        ARG_TIMEOUT => "int or nil",
        _ => "int",
    }
}

/// A server-to-client message. Sentinels are carried in the status tag, so a
/// user payload can never be mistaken for one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Full,
    Empty,
    Pong,
    Item(Vec<u8>),
    Count(u64),
    Rejected(String),
}

impl Reply {
    const STATUS_OK: i64 = 0;
    const STATUS_FULL: i64 = 1;
    const STATUS_EMPTY: i64 = 2;
    const STATUS_PONG: i64 = 3;
    const STATUS_DATA: i64 = 4;
    const STATUS_REJECTED: i64 = 5;

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Full => "FULL",
            Self::Empty => "EMPTY",
            Self::Pong => "PONG",
            Self::Item(_) | Self::Count(_) => "DATA",
            Self::Rejected(_) => "REJECTED",
        }
    }

    pub fn into_raw(self) -> RawEnvelope {
        let mut raw = RawEnvelope::new();
        raw.insert(FIELD_VERSION.to_owned(), Value::Integer(PROTOCOL_VERSION.into()));

        let status = match self {
            Self::Ok => Self::STATUS_OK,
            Self::Full => Self::STATUS_FULL,
            Self::Empty => Self::STATUS_EMPTY,
            Self::Pong => Self::STATUS_PONG,
            Self::Item(bytes) => {
                raw.insert(FIELD_DATA.to_owned(), Value::Binary(bytes));
                Self::STATUS_DATA
            }
            Self::Count(count) => {
                raw.insert(FIELD_DATA.to_owned(), Value::Integer(count.into()));
                Self::STATUS_DATA
            }
            Self::Rejected(reason) => {
                raw.insert(FIELD_REASON.to_owned(), Value::String(reason.into()));
                Self::STATUS_REJECTED
            }
        };
        raw.insert(FIELD_STATUS.to_owned(), Value::Integer(status.into()));

        raw
    }

    pub fn from_raw(raw: &RawEnvelope) -> Result<Self, MessageError> {
        check_version(raw)?;

        match parse_i64(raw.get(FIELD_STATUS), FIELD_STATUS)? {
            Self::STATUS_OK => Ok(Self::Ok),
            Self::STATUS_FULL => Ok(Self::Full),
            Self::STATUS_EMPTY => Ok(Self::Empty),
            Self::STATUS_PONG => Ok(Self::Pong),
            Self::STATUS_DATA => match raw.get(FIELD_DATA) {
                Some(Value::Binary(bytes)) => Ok(Self::Item(bytes.clone())),
                Some(Value::Integer(_)) => {
                    let value = parse_i64(raw.get(FIELD_DATA), FIELD_DATA)?;
                    u64::try_from(value)
                        .map(Self::Count)
                        .map_err(|_| MessageError::NegativeCount { value })
                }
                Some(_) => Err(MessageError::InvalidFieldType {
                    field: FIELD_DATA,
                    expected: "binary or int",
                }),
                None => Err(MessageError::MissingField { field: FIELD_DATA }),
            },
            Self::STATUS_REJECTED => {
                let reason = raw
                    .get(FIELD_REASON)
                    .and_then(Value::as_str)
                    .ok_or(MessageError::InvalidFieldType {
                        field: FIELD_REASON,
                        expected: "string",
                    })?;
                Ok(Self::Rejected(reason.to_owned()))
            }
            code => Err(MessageError::UnknownStatus { code }),
        }
    }
}

fn check_version(raw: &RawEnvelope) -> Result<(), MessageError> {
    let version = parse_i64(raw.get(FIELD_VERSION), FIELD_VERSION)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::InvalidProtocolVersion {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    Ok(())
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, MessageError> {
    let value = value.ok_or(MessageError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(MessageError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    integer
        .as_i64()
        .ok_or_else(|| MessageError::IntegerOutOfRange {
            field: field.to_owned(),
        })
}

fn parse_arguments(value: Option<&Value>) -> Result<Arguments, MessageError> {
    let entries = match value {
        None | Some(Value::Nil) => return Ok(Arguments::new()),
        Some(Value::Map(entries)) => entries,
        Some(_) => {
            return Err(MessageError::InvalidFieldType {
                field: FIELD_ARGS,
                expected: "map",
            })
        }
    };

    let mut args = Arguments::new();
    for (key, value) in entries {
        let key = key
            .as_str()
            .ok_or(MessageError::ArgumentKeyMustBeUtf8String)?;
        if args.contains_key(key) {
            return Err(MessageError::DuplicateArgument {
                key: key.to_owned(),
            });
        }
        args.insert(key.to_owned(), ArgValue::from_value(key, value)?);
    }

    Ok(args)
}
