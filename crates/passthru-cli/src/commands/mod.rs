//! Subcommand implementations

mod shell;

pub(crate) use shell::shell_command;

use eyre::WrapErr;
use nexum_pcsc_passthru::attr::format_hex;
use nexum_pcsc_passthru::ConnectAction;
use tracing::{debug, info};

use crate::bench::Bench;
use crate::display;

/// Print one line per reader
pub(crate) fn list_command(bench: &Bench) -> eyre::Result<()> {
    let readers = bench.device().readers();
    if readers.is_empty() {
        println!("No readers found!");
        return Ok(());
    }

    println!("Readers:");
    for reader in readers {
        println!("{}", display::reader_line(&reader.poll()));
    }
    Ok(())
}

/// Print the state report of `reader`
pub(crate) fn state_command(bench: &Bench, reader: u8) -> eyre::Result<()> {
    print!("{}", bench.attrs(reader)?.read_state());
    Ok(())
}

/// Connect, print the ATR, disconnect
pub(crate) fn atr_command(bench: &Bench, reader: u8) -> eyre::Result<()> {
    let attrs = bench.attrs(reader)?;
    attrs.write_connect("1").wrap_err("connect failed")?;
    let atr = attrs.reader().fetch_atr()?;
    println!("{}", format_hex(atr.as_bytes()));
    attrs.write_connect("0").wrap_err("disconnect failed")?;
    Ok(())
}

/// Accept compact hex as well as space-separated pairs
pub(crate) fn normalize_hex(input: &str) -> eyre::Result<String> {
    if input.trim().contains(char::is_whitespace) {
        return Ok(input.to_string());
    }
    let bytes = hex::decode(input.trim()).wrap_err_with(|| format!("invalid hex {input:?}"))?;
    Ok(format_hex(&bytes))
}

/// Connect, exchange every command, disconnect
pub(crate) fn transmit_command(
    bench: &Bench,
    reader: u8,
    commands: &[String],
) -> eyre::Result<()> {
    let attrs = bench.attrs(reader)?;
    if let ConnectAction::Connect(outcome) = attrs.write_connect("1")? {
        debug!(reader, ?outcome, "connect");
    }

    for command in commands {
        let command = normalize_hex(command)?;
        println!("> {command}");
        let response = attrs.write_transmit(&command)?;
        println!("{}", display::response(&response));
    }

    attrs.write_connect("0")?;
    info!(reader, count = commands.len(), "exchange complete");
    Ok(())
}

/// Cycle a card through every slot and print the resulting events
pub(crate) fn monitor_command(bench: &Bench, cycles: usize) -> eyre::Result<()> {
    let events = bench.subscribe();
    let atr = [0x3B, 0x00];

    for cycle in 0..cycles {
        for slot in 0..bench.device().reader_count() {
            debug!(cycle, slot, "cycling card");
            bench.insert(slot, &atr)?;
            bench.remove(slot)?;
        }
    }

    let mut seen = 0usize;
    for event in events.try_iter() {
        println!("{}", display::event(&event));
        seen += 1;
    }
    println!("{}", display::success(&format!("{seen} events")));
    Ok(())
}
