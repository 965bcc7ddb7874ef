//! sdbdump - SDB file reader
//!
//! Dumps the read-side projections of an SDB market-data file: the header
//! (`--info`), the quote stream (`-Q`), the trade stream (`-T`), or the
//! candle index at a chosen resolution (`-C 5m`).
//!
//! ```bash
//! # File identity and price geometry
//! sdbdump 20151015.KRX.KR4101.KR4101K60008.sdb --info
//!
//! # Quotes and trades interleaved, local-time stamps
//! sdbdump 20151015.KRX.KR4101.KR4101K60008.sdb -Q -T --tz-local
//!
//! # Five-minute candles
//! sdbdump 20151015.KRX.KR4101.KR4101K60008.sdb -C 5m
//! ```
//!
//! Exit code is 0 on success; any core error prints one diagnostic line and
//! exits nonzero.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;

use sdb_core::types::PxConv;
use sdb_storage::{Event, SdbReader};

#[derive(Parser)]
#[command(name = "sdbdump")]
#[command(about = "Dump quotes, trades and candles from an SDB market-data file", long_about = None)]
struct Cli {
    /// SDB file to read
    file: PathBuf,

    /// Print the file header and exit
    #[arg(short, long)]
    info: bool,

    /// Print quotes
    #[arg(short = 'Q', long)]
    quotes: bool,

    /// Print trades
    #[arg(short = 'T', long)]
    trades: bool,

    /// Print candles of the given resolution, e.g. 30s, 5m, 1h
    #[arg(short = 'C', long, value_name = "RES")]
    candles: Option<String>,

    /// Limit printed book depth
    #[arg(short, long, default_value_t = 100)]
    max_depth: usize,

    /// Print prices without quantities
    #[arg(short = 'p', long)]
    px_only: bool,

    /// Print time as integer microseconds (or milliseconds with --msec)
    /// since the UNIX epoch
    #[arg(long)]
    epoch: bool,

    /// Millisecond time resolution (default: microsecond)
    #[arg(long)]
    msec: bool,

    /// Include the date in timestamps
    #[arg(short = 'D', long)]
    full_date: bool,

    /// Format timestamps in the file's local time zone
    #[arg(short = 'z', long)]
    tz_local: bool,

    /// Field delimiter
    #[arg(long, default_value_t = '|')]
    delim: char,

    /// Delimiter between price levels
    #[arg(long, default_value_t = ' ')]
    px_delim: char,

    /// Delimiter between quantity and price within a level
    #[arg(long, default_value_t = '@')]
    qty_delim: char,

    /// Output filename (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.epoch && cli.tz_local {
        bail!("epoch timestamps cannot be in the local time zone");
    }
    if !cli.info && !cli.quotes && !cli.trades && cli.candles.is_none() {
        bail!("nothing to do: pass --info, -Q, -T or -C");
    }

    let resolution = cli
        .candles
        .as_deref()
        .map(parse_resolution)
        .transpose()?;

    let mut out: BufWriter<Box<dyn Write>> = BufWriter::new(match &cli.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
            Box::new(
                fs::File::create(path)
                    .with_context(|| format!("cannot create {}", path.display()))?,
            )
        }
        None => Box::new(io::stdout()),
    });

    let mut reader = SdbReader::open(&cli.file)
        .with_context(|| format!("cannot open {}", cli.file.display()))?;

    if cli.info {
        print_info(&mut out, &reader)?;
    } else if let Some(resolution) = resolution {
        print_candles(&mut out, &reader, resolution, &cli)?;
    } else {
        print_streams(&mut out, &mut reader, &cli)?;
    }

    out.flush()?;
    Ok(())
}

/// Parse `Ns`/`Nm`/`Nh` into seconds.
fn parse_resolution(text: &str) -> Result<u16> {
    let (num, unit) = text.split_at(text.len().saturating_sub(1));
    let n: u32 = num
        .parse()
        .with_context(|| format!("invalid candle resolution '{}'", text))?;
    let secs = match unit {
        "s" | "S" => n,
        "m" | "M" => n * 60,
        "h" | "H" => n * 3600,
        _ => bail!("invalid candle resolution '{}': use e.g. 30s, 5m, 1h", text),
    };
    if !(1..=3600).contains(&secs) {
        bail!("candle resolution out of range: {} seconds", secs);
    }
    Ok(secs as u16)
}

fn print_info(out: &mut impl Write, reader: &SdbReader) -> Result<()> {
    let h = reader.header();
    writeln!(out, "Version....: {}", h.version)?;
    writeln!(
        out,
        "Date.......: {} UTC ({})",
        h.date.format("%Y-%m-%d %H:%M:%S"),
        h.tz()
    )?;
    writeln!(out, "Exchange...: {}", h.exchange)?;
    writeln!(out, "Symbol.....: {}", h.symbol)?;
    writeln!(out, "Instrument.: {}", h.instrument)?;
    writeln!(out, "SecID......: {}", h.secid)?;
    writeln!(out, "Depth......: {}", h.depth)?;
    writeln!(
        out,
        "PxStep.....: {:.prec$}",
        h.px_step,
        prec = h.conv.precision as usize
    )?;
    writeln!(out, "PxPrecision: {}", h.conv.precision)?;
    writeln!(out, "PxScale....: {}", h.conv.scale)?;
    writeln!(out, "UUID.......: {}", h.uuid)?;
    writeln!(out, "Streams....: {:?}", reader.streams().streams())?;
    for hdr in reader.candles().headers() {
        writeln!(
            out,
            "Candles....: {}s x {} from {:02}:{:02}",
            hdr.resolution(),
            hdr.candles().len(),
            hdr.start_time() / 3600,
            hdr.start_time() % 3600 / 60,
        )?;
    }
    Ok(())
}

struct TimeFmt {
    epoch: bool,
    msec: bool,
    full_date: bool,
    tz_offset: Duration,
}

impl TimeFmt {
    fn new(cli: &Cli, tz_offset_secs: i32) -> Self {
        Self {
            epoch: cli.epoch,
            msec: cli.msec,
            full_date: cli.full_date,
            tz_offset: if cli.tz_local {
                Duration::seconds(i64::from(tz_offset_secs))
            } else {
                Duration::zero()
            },
        }
    }

    fn format(&self, time: DateTime<Utc>) -> String {
        if self.epoch {
            return if self.msec {
                time.timestamp_millis().to_string()
            } else {
                time.timestamp_micros().to_string()
            };
        }
        let local = time + self.tz_offset;
        let pattern = match (self.full_date, self.msec) {
            (true, true) => "%Y%m%d %H:%M:%S%.3f",
            (true, false) => "%Y%m%d %H:%M:%S%.6f",
            (false, true) => "%H:%M:%S%.3f",
            (false, false) => "%H:%M:%S%.6f",
        };
        local.format(pattern).to_string()
    }
}

fn format_px(conv: &PxConv, steps: i64) -> String {
    format!("{:.prec$}", conv.to_f64(steps), prec = conv.precision as usize)
}

fn print_streams(out: &mut impl Write, reader: &mut SdbReader, cli: &Cli) -> Result<()> {
    let conv = reader.header().conv;
    let tfmt = TimeFmt::new(cli, reader.header().tz_offset_secs);
    let both = cli.quotes && cli.trades;
    let d = cli.delim;

    let time_col = format!(
        "#{}Time({})",
        if cli.tz_local { "Local" } else { "UTC" },
        if cli.msec { "ms" } else { "us" }
    );
    if cli.quotes {
        let tag = if both { format!("{}Q", d) } else { String::new() };
        writeln!(out, "{}{}{}Bids{}Asks", time_col, tag, d, d)?;
    }
    if cli.trades {
        let tag = if both { format!("{}T", d) } else { String::new() };
        writeln!(
            out,
            "{}{}{}Side{}Price{}Qty{}Aggr{}TradeID{}OrderID",
            time_col, tag, d, d, d, d, d, d
        )?;
    }

    let mut failure: Option<io::Error> = None;
    reader.read(|event| {
        let line = match event {
            Event::Seconds { .. } => return true,
            Event::Quote { time, quote } => {
                if !cli.quotes {
                    return true;
                }
                let mut line = tfmt.format(time);
                if both {
                    line.push(d);
                    line.push('Q');
                }
                line.push(d);
                for (i, level) in quote.bids().take(cli.max_depth).enumerate() {
                    if i > 0 {
                        line.push(cli.px_delim);
                    }
                    if !cli.px_only {
                        line.push_str(&level.qty.to_string());
                        line.push(cli.qty_delim);
                    }
                    line.push_str(&format_px(&conv, level.px));
                }
                line.push(d);
                for (i, level) in quote.asks().iter().take(cli.max_depth).enumerate() {
                    if i > 0 {
                        line.push(cli.px_delim);
                    }
                    if !cli.px_only {
                        line.push_str(&level.qty.to_string());
                        line.push(cli.qty_delim);
                    }
                    line.push_str(&format_px(&conv, level.px));
                }
                line
            }
            Event::Trade { time, trade } => {
                if !cli.trades {
                    return true;
                }
                let mut line = tfmt.format(time);
                if both {
                    line.push(d);
                    line.push('T');
                }
                line.push(d);
                line.push(trade.side().as_char());
                line.push(d);
                line.push_str(&format_px(&conv, trade.px));
                line.push(d);
                if trade.has_qty() {
                    line.push_str(&trade.qty.to_string());
                }
                line.push(d);
                line.push(trade.aggr().as_char());
                line.push(d);
                if trade.has_trade_id() {
                    line.push_str(&trade.trade_id.to_string());
                }
                line.push(d);
                if trade.has_order_id() {
                    line.push_str(&trade.order_id.to_string());
                }
                line
            }
        };
        match writeln!(out, "{}", line) {
            Ok(()) => true,
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    })?;

    if let Some(e) = failure {
        return Err(e).context("error writing output");
    }
    Ok(())
}

fn print_candles(
    out: &mut impl Write,
    reader: &SdbReader,
    resolution: u16,
    cli: &Cli,
) -> Result<()> {
    let conv = reader.header().conv;
    let midnight = reader.midnight();
    let tfmt = TimeFmt::new(cli, reader.header().tz_offset_secs);
    let d = cli.delim;

    let Some(hdr) = reader
        .candles()
        .headers()
        .iter()
        .find(|h| h.resolution() == resolution)
    else {
        bail!(
            "no candle index at resolution {}s in {}",
            resolution,
            reader.path().display()
        );
    };

    writeln!(
        out,
        "#Time{}Open{}High{}Low{}Close{}BuyVol{}SellVol",
        d, d, d, d, d, d
    )?;
    for (idx, candle) in hdr.candles().iter().enumerate() {
        if candle.volume() == 0 && candle.open == 0 && candle.close == 0 {
            continue; // nothing traded in this bucket
        }
        let time = midnight + Duration::seconds(i64::from(hdr.candle_to_time(idx)));
        writeln!(
            out,
            "{}{}{}{}{}{}{}{}{}{}{}{}{}",
            tfmt.format(time),
            d,
            format_px(&conv, i64::from(candle.open)),
            d,
            format_px(&conv, i64::from(candle.high)),
            d,
            format_px(&conv, i64::from(candle.low)),
            d,
            format_px(&conv, i64::from(candle.close)),
            d,
            candle.buy_volume,
            d,
            candle.sell_volume,
        )?;
    }
    Ok(())
}
