//! Typed view of the turntable wire protocol.
//!
//! The device speaks newline-delimited ASCII tokens over the serial line:
//!
//! ```text
//! -> GET ACC        query acceleration
//! -> SET ACC <n>    set acceleration (1-10)
//! -> FM <angle>     start rotating by angle (degrees, signed)
//! -> STOP           halt motion
//! -> SOFTSTOP       halt motion, decelerating
//! <- <int>          acceleration value (reply to GET ACC)
//! <- OK / ERR       command accepted / rejected
//! <- POS <angle>    current position while rotating
//! <- END            motion finished or halted
//! ```
//!
//! There are no correlation identifiers: responses are matched to requests
//! by protocol knowledge and timing alone, which is why outcomes are modeled
//! as explicit tagged values here rather than raised errors.

/// Rotations smaller than this are treated as "no rotation at all".
pub const ANGLE_EPSILON: f64 = 1e-4;

/// A command line sent to the table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableCommand {
    GetAcceleration,
    SetAcceleration(i32),
    Rotate(f64),
    Stop,
    SoftStop,
}

impl TableCommand {
    /// Wire form of the command, without the line terminator.
    pub fn encode(&self) -> String {
        match self {
            Self::GetAcceleration => "GET ACC".to_string(),
            Self::SetAcceleration(value) => format!("SET ACC {value}"),
            Self::Rotate(angle) => format!("FM {angle}"),
            Self::Stop => "STOP".to_string(),
            Self::SoftStop => "SOFTSTOP".to_string(),
        }
    }

    /// Parse one incoming line on the device side. Unknown tokens yield
    /// `None` and are skipped by the emulator, matching the hardware.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line == "GET ACC" {
            return Some(Self::GetAcceleration);
        }
        if line == "STOP" {
            return Some(Self::Stop);
        }
        if line == "SOFTSTOP" {
            return Some(Self::SoftStop);
        }
        if let Some(rest) = line.strip_prefix("SET ACC") {
            return rest.trim().parse().ok().map(Self::SetAcceleration);
        }
        if let Some(rest) = line.strip_prefix("FM") {
            return rest.trim().parse().ok().map(Self::Rotate);
        }
        None
    }
}

/// A response token received from the table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableResponse {
    Ack,
    Err,
    Position(f64),
    End,
    /// Bare integer, the acceleration readback.
    Value(i32),
}

impl TableResponse {
    /// Wire form of the response, without the line terminator.
    pub fn encode(&self) -> String {
        match self {
            Self::Ack => "OK".to_string(),
            Self::Err => "ERR".to_string(),
            Self::Position(angle) => format!("POS {angle}"),
            Self::End => "END".to_string(),
            Self::Value(value) => value.to_string(),
        }
    }

    /// Parse one incoming line on the client side. Unknown tokens yield
    /// `None` and are skipped by the driver's wait loops.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "OK" => return Some(Self::Ack),
            "ERR" => return Some(Self::Err),
            "END" => return Some(Self::End),
            _ => {}
        }
        if let Some(rest) = line.strip_prefix("POS") {
            return rest.trim().parse().ok().map(Self::Position);
        }
        line.parse().ok().map(Self::Value)
    }
}
