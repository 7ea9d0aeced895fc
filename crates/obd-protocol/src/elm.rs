//! ELM327 response framing
//!
//! The adapter answers every command with CR separated lines terminated by
//! a `>` prompt. These helpers turn that text into OBD payload bytes.

use crate::error::ObdError;

/// Prompt byte that ends every adapter response
pub const PROMPT: u8 = b'>';

/// Markers meaning the adapter is alive but no ECU answered
const NO_BUS_MARKERS: [&str; 5] = [
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "FB ERROR",
];

/// Split a raw response into meaningful lines.
///
/// Drops the command echo, blank lines and the `SEARCHING...` / `BUS INIT`
/// progress lines the adapter prints during protocol search.
pub fn clean_lines(raw: &str, command: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(|l| l.trim().trim_end_matches('>').trim())
        .filter(|l| !l.is_empty())
        .filter(|l| !l.eq_ignore_ascii_case(command))
        .filter(|l| !l.starts_with("SEARCHING") && !l.starts_with("BUS INIT"))
        .map(str::to_string)
        .collect()
}

/// Whether the lines report that no vehicle bus answered
pub fn is_no_bus(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|l| NO_BUS_MARKERS.iter().any(|m| l.contains(m)))
}

/// Whether the adapter answered `NO DATA`
pub fn is_no_data(lines: &[String]) -> bool {
    lines.iter().any(|l| l.contains("NO DATA"))
}

/// Map adapter status lines onto errors, `None` when the lines carry data
pub fn status_error(lines: &[String], command: &str) -> Option<ObdError> {
    if lines.iter().any(|l| l == "?") {
        return Some(ObdError::UnknownCommand(command.to_string()));
    }
    if is_no_bus(lines) {
        return Some(ObdError::VehicleNotConnected);
    }
    if lines.iter().any(|l| l.contains("STOPPED")) {
        return Some(ObdError::InvalidResponse(format!("{} interrupted", command)));
    }
    None
}

/// Parse a hex line with or without spaces (`41 0C 1A F8` or `410C1AF8`)
pub fn hex_bytes(line: &str) -> Option<Vec<u8>> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() || compact.len() % 2 != 0 {
        return None;
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(compact.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Group response lines into frames.
///
/// Single-frame answers give one frame per line (one per ECU). ISO-TP
/// multi-frame answers arrive as a three digit length line followed by
/// `0:`, `1:` ... segments, which are joined into one frame and trimmed to
/// the announced length.
pub fn frames(lines: &[String]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, Vec<u8>)> = None;

    for line in lines {
        if line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Some((_, bytes)) = pending.take() {
                out.push(bytes);
            }
            let len = usize::from_str_radix(line, 16).unwrap_or(0);
            pending = Some((len, Vec::with_capacity(len)));
            continue;
        }

        if let Some((index, rest)) = line.split_once(':') {
            if index.trim().chars().all(|c| c.is_ascii_hexdigit()) {
                if let Some(bytes) = hex_bytes(rest) {
                    match pending.as_mut() {
                        Some((_, acc)) => acc.extend(bytes),
                        None => pending = Some((0, bytes)),
                    }
                }
                continue;
            }
        }

        if let Some(bytes) = hex_bytes(line) {
            out.push(bytes);
        }
    }

    if let Some((len, mut bytes)) = pending {
        if len > 0 && bytes.len() > len {
            bytes.truncate(len);
        }
        out.push(bytes);
    }

    out
}

/// Find the payload following the `mode + 0x40` echo (and PID echo when
/// given) in the first frame that carries it.
pub fn extract_payload(lines: &[String], mode: u8, pid: Option<u8>) -> Result<Vec<u8>, ObdError> {
    let echo = mode.wrapping_add(0x40);
    for frame in frames(lines) {
        match pid {
            Some(p) if frame.len() >= 2 && frame[0] == echo && frame[1] == p => {
                return Ok(frame[2..].to_vec());
            }
            None if !frame.is_empty() && frame[0] == echo => {
                return Ok(frame[1..].to_vec());
            }
            _ => {}
        }
    }

    let expected = match pid {
        Some(p) => format!("{:02X} {:02X}", echo, p),
        None => format!("{:02X}", echo),
    };
    Err(ObdError::InvalidResponse(format!(
        "expected header {} in {:?}",
        expected, lines
    )))
}

/// Whether the lines contain a frame echoing the given mode (and PID)
pub fn carries_echo(lines: &[String], mode: u8, pid: Option<u8>) -> bool {
    extract_payload(lines, mode, pid).is_ok() || is_no_data(lines) || is_no_bus(lines)
}

/// Whether the lines answer an OBD request (positive mode echo or
/// `NO DATA`) rather than an AT command
pub fn is_obd_answer(lines: &[String]) -> bool {
    is_no_data(lines) || frames(lines).iter().any(|f| matches!(f.first(), Some(0x41..=0x4A)))
}
