use anyhow::Result;
use clap::AppSettings;
use clap::Arg;
use clap::SubCommand;
use futures::pin_mut;
use futures::StreamExt;
use lazy_static::lazy_static;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::PathBuf;
use zil::parse_chain;
use zil::ChainEntry;
use zil::FileVdev;
use zil::LogHeaderPhys;

lazy_static! {
    static ref LOG_PATTERN: String = "[{d(%Y-%m-%d %H:%M:%S%.3f)}][{t}][{l}] {m}{n}".to_string();
}

fn get_logging_level(verbosity: u64) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn setup_logging(verbosity: u64) {
    let config = Config::builder()
        .appender(
            Appender::builder().build(
                "stdout",
                Box::new(
                    ConsoleAppender::builder()
                        .encoder(Box::new(PatternEncoder::new(&*LOG_PATTERN)))
                        .build(),
                ),
            ),
        )
        .build(
            Root::builder()
                .appender("stdout")
                .build(get_logging_level(verbosity)),
        )
        .unwrap();

    log4rs::init_config(config).unwrap();
}

async fn print_header(vdev: &std::sync::Arc<FileVdev>) -> Result<LogHeaderPhys> {
    let header = LogHeaderPhys::read(&**vdev).await?;
    println!("{:#?}", header);
    Ok(header)
}

async fn dump_chain(vdev: std::sync::Arc<FileVdev>, records: bool) -> Result<()> {
    let header = LogHeaderPhys::read(&*vdev).await?;
    println!("{:#?}", header);
    let stream = parse_chain(vdev, header, records);
    pin_mut!(stream);
    let mut blocks = 0u64;
    let mut record_count = 0u64;
    while let Some(entry) = stream.next().await {
        match entry {
            Ok(ChainEntry::Block { bp, nused }) => {
                println!("block {}: {} bytes used", bp, nused);
                blocks += 1;
            }
            Ok(ChainEntry::Record(record)) => {
                println!(
                    "  seq {} txg {} {:?}",
                    record.seq,
                    record.txg,
                    record.body.record_type()
                );
                record_count += 1;
            }
            Err(e) => {
                println!("chain walk stopped: {}", e);
                break;
            }
        }
    }
    println!("{} blocks, {} records", blocks, record_count);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // In a shell pipeline whose consumer exits early we get a SIGPIPE; the
    // default Rust behavior is to abort.  Terminate quietly instead, like
    // other UNIX utilities.
    // reference: https://github.com/rust-lang/rust/issues/46016
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let matches = clap::App::new("zildb")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .about("ZFS Intent Log Debugger")
        .version("1.0")
        .arg(
            Arg::with_name("device")
                .help("log device (repeat for a multi-vdev log, in vdev order)")
                .required(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .multiple(true)
                .help("log verbosity (-v info, -vv debug, -vvv trace)"),
        )
        .arg(
            Arg::with_name("tunable-config")
                .short("t")
                .long("tunable-config")
                .takes_value(true)
                .help("tunable overrides (toml)"),
        )
        .subcommand(SubCommand::with_name("header").about("print the on-disk log header"))
        .subcommand(
            SubCommand::with_name("dump")
                .about("walk the block chain and print its contents")
                .arg(
                    Arg::with_name("norecords")
                        .long("norecords")
                        .short("n")
                        .help("print blocks only, skipping the records inside"),
                ),
        )
        .get_matches();

    setup_logging(matches.occurrences_of("verbosity"));
    if let Some(config) = matches.value_of("tunable-config") {
        util::read_tunable_config(config);
    }

    let paths = matches
        .values_of("device")
        .unwrap()
        .map(PathBuf::from)
        .collect::<Vec<_>>();
    let vdev = FileVdev::open(&paths).await?;

    match matches.subcommand() {
        ("header", Some(_)) => {
            print_header(&vdev).await?;
        }
        ("dump", Some(subcommand_matches)) => {
            dump_chain(vdev, !subcommand_matches.is_present("norecords")).await?;
        }
        _ => unreachable!(),
    };
    Ok(())
}
