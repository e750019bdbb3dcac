//! Per-command framing contracts.
//!
//! The header line alone does not say whether the token after the command is
//! a transaction id, or whether the last token is a payload length. Both are
//! properties of the command, so the codec looks them up here.

/// Whether a command's first parameter is a transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TridRule {
    /// Always carries a trid.
    Always,
    /// Never carries a trid (server notifications, P2P inner frames).
    Never,
    /// Carries a trid when the first token is numeric.
    IfNumeric,
}

/// Framing contract of a command token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub trid: TridRule,
    /// The last header parameter, when numeric, is the payload length.
    pub payload: bool,
}

impl CommandSpec {
    const fn new(trid: TridRule, payload: bool) -> Self {
        Self { trid, payload }
    }

    /// Whether a frame of this command sent by the client gets a trid
    /// assigned by the transport.
    pub fn outbound_trid(&self) -> bool {
        !matches!(self.trid, TridRule::Never)
    }
}

const fn always(payload: bool) -> CommandSpec {
    CommandSpec::new(TridRule::Always, payload)
}

const fn never(payload: bool) -> CommandSpec {
    CommandSpec::new(TridRule::Never, payload)
}

/// Contract used for unknown commands.
pub const UNKNOWN: CommandSpec = CommandSpec::new(TridRule::IfNumeric, false);

/// Looks up the framing contract of `command`.
///
/// Three-digit numeric commands are server errors and always carry the trid
/// of the request they answer.
pub fn spec_for(command: &str) -> CommandSpec {
    if is_error_code(command) {
        return always(false);
    }
    match command {
        // nameserver and switchboard requests/replies
        "VER" | "CVR" | "USR" | "XFR" | "SYN" | "ADC" | "REM" | "ADG" | "RMG" | "REG" | "CHG"
        | "ILN" | "PRP" | "BLP" | "CAL" | "ANS" | "IRO" | "ACK" | "NAK" | "CHL" => always(false),
        "UUX" | "ADL" | "RML" | "GCF" | "QRY" => always(true),
        "LSG" | "LST" | "NLN" | "FLN" | "RNG" | "PNG" | "QNG" | "OUT" | "JOI" | "BYE" => {
            never(false)
        }
        "UBX" | "NOT" => never(true),
        "MSG" => CommandSpec::new(TridRule::IfNumeric, true),
        // P2P inner frames
        "INV" | "REQ" | "ACC" | "DEC" | "DAK" | "RSM" | "CLS" | "ABT" => never(false),
        "DAT" => never(true),
        _ => UNKNOWN,
    }
}

/// Returns true for three-digit error codes.
pub fn is_error_code(command: &str) -> bool {
    command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit())
}
