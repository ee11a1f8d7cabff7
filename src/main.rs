//! Thin driver: parses a path and optional command tail off `argv`, boots a
//! `Machine`, and pumps it on its own thread while this thread forwards
//! keypresses and repaints the text screen (spec.md §5, §6; SPEC_FULL.md §C).

use em8086::machine::{BootTarget, Machine};
use em8086::registers::RunState;
use em8086::video::{COLUMNS, ROWS, VIDEO_OFFSET, VIDEO_SEGMENT};
use std::io::{stdout, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termion::input::TermRead;
use termion::raw::IntoRawMode;
use termion::{clear, cursor, event::Key};

fn usage() -> ! {
    eprintln!("usage: runpc <floppy.img | program.com> [command tail...]");
    std::process::exit(2);
}

fn parse_target(args: &[String]) -> BootTarget {
    let path = PathBuf::from(&args[0]);
    let is_com = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("com")).unwrap_or(false);
    if is_com {
        BootTarget::Com { path, cmdline: args[1..].join(" ") }
    } else {
        BootTarget::Floppy(path)
    }
}

fn render(machine: &Machine, out: &mut impl Write) -> std::io::Result<()> {
    write!(out, "{}{}", clear::All, cursor::Goto(1, 1))?;
    for row in 0..ROWS {
        for col in 0..COLUMNS {
            let offset = VIDEO_OFFSET + (row as u16 * COLUMNS as u16 + col as u16) * 2;
            let c = machine.memory.read8(VIDEO_SEGMENT, offset).unwrap_or(b' ');
            let c = if c.is_ascii_graphic() || c == b' ' { c } else { b' ' };
            write!(out, "{}", c as char)?;
        }
        write!(out, "\r\n")?;
    }
    let (row, col) = (machine.cursor.row, machine.cursor.column);
    write!(out, "{}", cursor::Goto(col as u16 + 1, row as u16 + 1))?;
    out.flush()
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }
    let target = parse_target(&args);

    let machine = match Machine::boot(target) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to boot: {e}");
            std::process::exit(1);
        }
    };
    let console = machine.console.clone();
    let shared = Arc::new(Mutex::new(machine));

    let emulator = {
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || loop {
            let mut machine = shared.lock().unwrap();
            if machine.run_state == RunState::Stopped {
                break;
            }
            if machine.run_state == RunState::Paused {
                drop(machine);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            if let Err(e) = machine.tick() {
                log::error!("tick failed at {:#06x}:{:#06x}: {e}", machine.registers.last_cs, machine.registers.last_ip);
                break;
            }
            drop(machine);
            std::thread::sleep(Duration::from_micros(1));
        })
    };

    let _raw = stdout().into_raw_mode().ok();

    let keys = {
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            for key in std::io::stdin().keys().flatten() {
                match key {
                    Key::Ctrl('c') => {
                        shared.lock().unwrap().stop();
                        break;
                    }
                    Key::Char(c) => console.push(c as u8),
                    Key::Backspace => console.push(0x08),
                    _ => {}
                }
            }
        })
    };

    let mut out = stdout();
    loop {
        {
            let machine = shared.lock().unwrap();
            let _ = render(&machine, &mut out);
            if machine.run_state == RunState::Stopped {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(33));
    }

    emulator.join().ok();
    drop(keys); // daemonized: process exit reclaims the blocked stdin reader

    let exit_code = shared.lock().unwrap().exit_code().unwrap_or(0);
    std::process::exit(exit_code as i32);
}
