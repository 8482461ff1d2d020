//! Line-oriented shell over the text control surface

use std::io::{self, BufRead, Write};

use eyre::{OptionExt, eyre};
use nexum_pcsc_passthru::event::ReaderEventReceiver;

use super::normalize_hex;
use crate::bench::Bench;
use crate::display;

const HELP: &str = "\
commands:
  list                      list readers
  state <reader>            show the state report
  connect <reader> <value>  connect on non-zero, disconnect on zero
  transmit <reader> <hex>   send a command, e.g. transmit 0 00 A4 04 00
  insert <slot> [atr]       insert a card (default ATR 3B 00)
  remove <slot>             remove the card
  irq                       raise the interrupt line
  events                    print pending reader events
  quit                      leave the shell";

/// Read commands from standard input until EOF or `quit`
pub(crate) fn shell_command(bench: &Bench) -> eyre::Result<()> {
    let events = bench.subscribe();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("passthru> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }

        if let Err(err) = run_line(bench, &events, line) {
            println!("{}", display::failure(&format!("{err:#}")));
        }
    }
    Ok(())
}

fn run_line(bench: &Bench, events: &ReaderEventReceiver, line: &str) -> eyre::Result<()> {
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "help" => println!("{HELP}"),
        "list" => super::list_command(bench)?,
        "state" => super::state_command(bench, parse_index(rest)?)?,
        "connect" => {
            let (reader, value) = split_reader(rest)?;
            let action = bench.attrs(reader)?.write_connect(value)?;
            println!("{}", display::success(&format!("{action:?}")));
        }
        "transmit" => {
            let (reader, hex) = split_reader(rest)?;
            let response = bench.attrs(reader)?.write_transmit(&normalize_hex(hex)?)?;
            println!("{}", display::response(&response));
        }
        "insert" => {
            let (slot, atr) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let atr = if atr.trim().is_empty() {
                vec![0x3B, 0x00]
            } else {
                hex::decode(atr.trim())?
            };
            bench.insert(slot.parse()?, &atr)?;
            print_events(events);
        }
        "remove" => {
            bench.remove(rest.parse()?)?;
            print_events(events);
        }
        "irq" => {
            let handled = bench.hardware().fire_irq();
            println!("{handled:?}");
            print_events(events);
        }
        "events" => print_events(events),
        other => return Err(eyre!("unknown command {other:?}, try help")),
    }
    Ok(())
}

fn parse_index(input: &str) -> eyre::Result<u8> {
    Ok(input.trim().parse()?)
}

fn split_reader(input: &str) -> eyre::Result<(u8, &str)> {
    let (reader, rest) = input
        .split_once(char::is_whitespace)
        .ok_or_eyre("expected <reader> <value>")?;
    Ok((parse_index(reader)?, rest))
}

fn print_events(events: &ReaderEventReceiver) {
    for event in events.try_iter() {
        println!("{}", display::event(&event));
    }
}
