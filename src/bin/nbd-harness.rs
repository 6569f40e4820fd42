//! Development/testing harness for the NBD client driver crate.
//!
//! Not part of the driver's public contract (spec §1 places "daemonization,
//! logging and CLI wrappers" out of scope) — this is the counterpart of
//! the surrounding disk stack that would normally own a `NbdDriver`, drive
//! its fd's readiness through a real reactor, and forward completions back
//! up a block-request chain. It exists so the crate can be exercised from
//! the command line without a full tapdisk-style daemon.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::bail;
use color_eyre::Result;
use log::info;

use tapdisk_nbd_client::driver::{NbdDriver, OpenFlags};
use tapdisk_nbd_client::errno::Errno;
use tapdisk_nbd_client::reactor::{PollReactor, Reactor};
use tapdisk_nbd_client::request::UpperRequest;

/// How long to wait for a single reactor tick before giving up (spec §9
/// notes there is no per-request timeout in the driver itself; this is a
/// harness-only liveness bound, the "upper layers must provide liveness
/// policy" spec §9 calls for).
const TICK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(version, about = "exercise the NBD client driver from the command line", long_about = None)]
struct Args {
    /// <unix-socket-path> | <ipv4>:<port> | <fd-receiver-id>
    name: String,

    /// Forward read requests instead of sending them over NBD.
    #[arg(long)]
    secondary: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate and print the export's size and sector size.
    Info,
    /// Read `count` sectors starting at `sector` and print them as hex.
    Read { sector: u64, count: u32 },
    /// Write `count` sectors of a repeated fill byte, starting at `sector`.
    Write {
        sector: u64,
        count: u32,
        #[arg(default_value_t = 0)]
        fill: u8,
    },
}

/// Drive `driver`'s fd through `reactor` until `done` is set.
fn run_to_completion(driver: &mut NbdDriver, reactor: &mut PollReactor, done: &Rc<Cell<bool>>) -> Result<()> {
    let Some(fd) = driver.as_raw_fd() else {
        return Ok(());
    };
    while !done.get() {
        if driver.wants_write() {
            reactor.register_writable(fd);
        } else {
            reactor.unregister_writable(fd);
        }
        if driver.wants_read() {
            reactor.register_readable(fd);
        } else {
            reactor.unregister_readable(fd);
        }

        let events = reactor.wait(Some(TICK_TIMEOUT))?;
        if events.is_empty() {
            bail!("timed out waiting for the nbd server to respond");
        }
        for event in events {
            if event.fd != fd {
                continue;
            }
            if event.writable {
                driver.on_writable()?;
            }
            if event.readable {
                driver.on_readable()?;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let mut flags = OpenFlags::empty();
    if args.secondary {
        flags |= OpenFlags::TD_OPEN_SECONDARY;
    }

    let mut driver = NbdDriver::new();
    if driver.open(&args.name, flags) != 0 {
        bail!("failed to open nbd export {:?}", args.name);
    }
    info!(
        target: "nbd",
        "export size = {} sectors x {} bytes",
        driver.size_sectors, driver.sector_size
    );

    let mut reactor = PollReactor::new();

    match args.command {
        Command::Info => {
            println!(
                "size_sectors={} sector_size={}",
                driver.size_sectors, driver.sector_size
            );
        }
        Command::Read { sector, count } => {
            let done = Rc::new(Cell::new(false));
            let result = Rc::new(Cell::new(0));
            let data = Rc::new(RefCell::new(Vec::new()));
            let (done_cb, result_cb, data_cb) = (done.clone(), result.clone(), data.clone());

            let len = count as usize * driver.sector_size as usize;
            let upper = UpperRequest::new(vec![0; len], move |code, buf| {
                result_cb.set(code);
                *data_cb.borrow_mut() = buf;
                done_cb.set(true);
            });
            let code = driver.queue_read(sector, count, upper, |upper| {
                // Nothing upstream to forward to in this standalone harness.
                upper.complete(-(Errno::ENOSYS as i32));
            });
            if code != 0 {
                bail!("queue_read failed with code {code}");
            }

            run_to_completion(&mut driver, &mut reactor, &done)?;
            if result.get() != 0 {
                bail!("read completed with error code {}", result.get());
            }
            for chunk in data.borrow().chunks(32) {
                let line: String = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{line}");
            }
        }
        Command::Write { sector, count, fill } => {
            let done = Rc::new(Cell::new(false));
            let result = Rc::new(Cell::new(0));
            let (done_cb, result_cb) = (done.clone(), result.clone());

            let len = count as usize * driver.sector_size as usize;
            let upper = UpperRequest::new(vec![fill; len], move |code, _buf| {
                result_cb.set(code);
                done_cb.set(true);
            });
            let code = driver.queue_write(sector, count, upper);
            if code != 0 {
                bail!("queue_write failed with code {code}");
            }

            run_to_completion(&mut driver, &mut reactor, &done)?;
            if result.get() != 0 {
                bail!("write completed with error code {}", result.get());
            }
            println!("wrote {count} sector(s) at sector {sector}");
        }
    }

    driver.close();
    Ok(())
}
