//! Line-oriented wire protocol shared by every node.
//!
//! Each TCP connection carries exactly one message encoded as
//! `"<epochMillis> | From: <senderId> | <TYPE>"` followed by a newline. The
//! format is plain text so the control console (or `nc`) can speak it too.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::NodeId;

const FIELD_SEPARATOR: &str = " | ";
const SENDER_LABEL: &str = "From:";
const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest inbound line accepted, newline included. Valid messages are well
/// under 64 bytes.
pub const MAX_LINE: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NewProcess,
    Election,
    Ok,
    Coordinator,
    CoordinatorAlive,
    Stop,
    CoordinatorStop,
    ForceStop,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::NewProcess,
        MessageKind::Election,
        MessageKind::Ok,
        MessageKind::Coordinator,
        MessageKind::CoordinatorAlive,
        MessageKind::Stop,
        MessageKind::CoordinatorStop,
        MessageKind::ForceStop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::NewProcess => "NEW_PROCESS",
            MessageKind::Election => "ELECTION",
            MessageKind::Ok => "OK",
            MessageKind::Coordinator => "COORDINATOR",
            MessageKind::CoordinatorAlive => "COORDINATOR_ALIVE",
            MessageKind::Stop => "STOP",
            MessageKind::CoordinatorStop => "COORDINATOR_STOP",
            MessageKind::ForceStop => "FORCE_STOP",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

/// Why a line could not be decoded. Receivers drop the line without replying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("expected 3 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
    #[error("sender field '{0}' is missing the 'From:' label")]
    MissingSenderLabel(String),
    #[error("invalid sender id '{0}'")]
    SenderId(String),
    #[error("unknown message type '{0}'")]
    UnknownKind(String),
}

/// A single protocol message. The receiver is implied by the connection it
/// travels on and is never encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub sender_id: NodeId,
    pub kind: MessageKind,
    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Creates a message stamped with the current wall-clock time.
    pub fn new(sender_id: NodeId, kind: MessageKind) -> Self {
        Self::with_timestamp(sender_id, kind, epoch_millis())
    }

    pub fn with_timestamp(sender_id: NodeId, kind: MessageKind, timestamp: u64) -> Self {
        Self {
            sender_id,
            kind,
            timestamp,
        }
    }

    /// Encodes the message as a wire line, without the trailing newline.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        line.parse()
    }

    /// Same layout as the wire format but with a `HH:MM:SS.mmm` (UTC) clock,
    /// which is what the central log shows.
    pub fn to_log_string(&self) -> String {
        let millis = self.timestamp % 1000;
        let secs_of_day = (self.timestamp / 1000) % 86_400;
        format!(
            "{:02}:{:02}:{:02}.{:03}{FIELD_SEPARATOR}{SENDER_LABEL} {}{FIELD_SEPARATOR}{}",
            secs_of_day / 3600,
            (secs_of_day / 60) % 60,
            secs_of_day % 60,
            millis,
            self.sender_id,
            self.kind
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{FIELD_SEPARATOR}{SENDER_LABEL} {}{FIELD_SEPARATOR}{}",
            self.timestamp, self.sender_id, self.kind
        )
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(LINE_ENDINGS);
        if line.trim().is_empty() {
            return Err(DecodeError::Empty);
        }

        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        let [timestamp, sender, kind] = fields.as_slice() else {
            return Err(DecodeError::FieldCount(fields.len()));
        };

        let timestamp = timestamp
            .trim()
            .parse()
            .map_err(|_| DecodeError::Timestamp(timestamp.to_string()))?;
        let sender_id = sender
            .trim()
            .strip_prefix(SENDER_LABEL)
            .ok_or_else(|| DecodeError::MissingSenderLabel(sender.to_string()))?
            .trim()
            .parse()
            .map_err(|_| DecodeError::SenderId(sender.to_string()))?;
        let kind = kind.trim().parse()?;

        Ok(Message::with_timestamp(sender_id, kind, timestamp))
    }
}

/// Milliseconds since the Unix epoch. A clock set before 1970 reads as 0.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Reads one line from the connection, without its line ending. Returns
/// `None` if the peer closed the connection before sending anything. Lines
/// longer than [`MAX_LINE`] are rejected with `InvalidData`.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = (&mut *reader).take(MAX_LINE).read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    if bytes as u64 >= MAX_LINE && !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE} bytes"),
        ));
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes `line` plus a newline delimiter and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_the_reference_line_format() {
        let message = Message::with_timestamp(4, MessageKind::CoordinatorAlive, 1_700_000_000_123);
        assert_eq!(
            message.encode(),
            "1700000000123 | From: 4 | COORDINATOR_ALIVE"
        );
    }

    #[test]
    fn every_kind_survives_encoding() {
        for kind in MessageKind::ALL {
            let message = Message::with_timestamp(12, kind, 42);
            assert_eq!(Message::decode(&message.encode()), Ok(message));
        }
    }

    #[test]
    fn extreme_ids_and_timestamps_survive_encoding() {
        let extremes = [
            (0, 0),
            (NodeId::MAX, 0),
            (0, u64::MAX),
            (NodeId::MAX, u64::MAX),
        ];
        for (sender, timestamp) in extremes {
            let message =
                Message::with_timestamp(sender, MessageKind::CoordinatorAlive, timestamp);
            let line = message.encode();
            assert!((line.len() as u64) < MAX_LINE, "{line} does not fit a frame");
            assert_eq!(Message::decode(&line), Ok(message));
        }
        assert_eq!(
            Message::decode("18446744073709551615 | From: 4294967295 | FORCE_STOP"),
            Ok(Message::with_timestamp(NodeId::MAX, MessageKind::ForceStop, u64::MAX))
        );
        assert!(matches!(
            Message::decode("18446744073709551616 | From: 1 | OK"),
            Err(DecodeError::Timestamp(_))
        ));
        assert!(matches!(
            Message::decode("1 | From: 4294967296 | OK"),
            Err(DecodeError::SenderId(_))
        ));
    }

    #[test]
    fn decode_tolerates_line_endings_and_padding() {
        let decoded = Message::decode("17 |  From:  3  | ELECTION \r\n").unwrap();
        assert_eq!(decoded, Message::with_timestamp(3, MessageKind::Election, 17));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(Message::decode(""), Err(DecodeError::Empty));
        assert_eq!(Message::decode("\n"), Err(DecodeError::Empty));
        assert_eq!(
            Message::decode("17 | From: 3"),
            Err(DecodeError::FieldCount(2))
        );
        assert_eq!(
            Message::decode("17 | From: 3 | OK | extra"),
            Err(DecodeError::FieldCount(4))
        );
        assert!(matches!(
            Message::decode("soon | From: 3 | OK"),
            Err(DecodeError::Timestamp(_))
        ));
        assert!(matches!(
            Message::decode("17 | 3 | OK"),
            Err(DecodeError::MissingSenderLabel(_))
        ));
        assert!(matches!(
            Message::decode("17 | From: -3 | OK"),
            Err(DecodeError::SenderId(_))
        ));
        assert_eq!(
            Message::decode("17 | From: 3 | ok"),
            Err(DecodeError::UnknownKind("ok".into()))
        );
        assert!(Message::decode("garbage").is_err());
    }

    #[test]
    fn log_string_renders_utc_clock() {
        // 01:02:03.456 on 1970-01-02
        let timestamp = 86_400_000 + 3_723_456;
        let message = Message::with_timestamp(1, MessageKind::Ok, timestamp);
        assert_eq!(message.to_log_string(), "01:02:03.456 | From: 1 | OK");
    }

    #[tokio::test]
    async fn line_helpers_frame_one_message() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = Message::new(2, MessageKind::Coordinator);

        write_line(&mut writer, &message.encode())
            .await
            .expect("write line");
        drop(writer);

        let line = read_line(&mut reader)
            .await
            .expect("read line")
            .expect("expected a line");
        assert_eq!(Message::decode(&line), Ok(message));
        assert_eq!(read_line(&mut reader).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn overlong_lines_are_refused() {
        let flood = vec![b'7'; 4 * MAX_LINE as usize];
        let mut reader = tokio::io::BufReader::new(flood.as_slice());

        let err = read_line(&mut reader).await.expect_err("line must be bounded");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn a_line_filling_the_frame_exactly_is_accepted() {
        let mut frame = vec![b'7'; MAX_LINE as usize - 1];
        frame.push(b'\n');
        let mut reader = tokio::io::BufReader::new(frame.as_slice());

        let line = read_line(&mut reader).await.expect("read line").expect("a line");
        assert_eq!(line.len() as u64, MAX_LINE - 1);
    }
}
