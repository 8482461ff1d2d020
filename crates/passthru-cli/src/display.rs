//! Display utilities

use colored::Colorize;
use nexum_pcsc_passthru::attr::format_hex;
use nexum_pcsc_passthru::{ReaderEvent, ReaderSnapshot};

/// Format a success message
pub(crate) fn success(message: &str) -> String {
    format!("{}", message.green().bold())
}

/// Format an error message
pub(crate) fn failure(message: &str) -> String {
    format!("{}", message.red().bold())
}

/// One-line summary of a reader
pub(crate) fn reader_line(snapshot: &ReaderSnapshot) -> String {
    let card = if snapshot.status.is_present() {
        "card present".green()
    } else {
        "no card".dimmed()
    };
    let session = if snapshot.connected {
        "connected".cyan()
    } else {
        "idle".normal()
    };
    format!("{}. {} ({})", snapshot.index, card, session)
}

/// Response bytes with the status word highlighted
pub(crate) fn response(bytes: &[u8]) -> String {
    if bytes.len() < 2 {
        return format!("< {}", format_hex(bytes).yellow());
    }
    let (data, sw) = bytes.split_at(bytes.len() - 2);
    let sw_text = format_hex(sw);
    let sw_text = if sw == [0x90, 0x00] {
        sw_text.green()
    } else {
        sw_text.yellow()
    };
    if data.is_empty() {
        format!("< {sw_text}")
    } else {
        format!("< {} {sw_text}", format_hex(data))
    }
}

/// A reader event
pub(crate) fn event(event: &ReaderEvent) -> String {
    let reader = event.reader();
    match event {
        ReaderEvent::CardInserted { .. } => format!("[{reader}] {}", "card inserted".green()),
        ReaderEvent::CardRemoved { .. } => format!("[{reader}] {}", "card removed".yellow()),
        ReaderEvent::SessionLost { .. } => format!("[{reader}] {}", "session lost".red()),
        ReaderEvent::StatusChanged {
            previous, current, ..
        } => format!(
            "[{reader}] status {:#06x} -> {:#06x}",
            previous.bits(),
            current.bits()
        ),
    }
}
