//! Random process exit at interesting points, to exercise recovery on
//! restart.  Set the "die_mtbf_secs" tunable to the desired mean time between
//! failures, in seconds; a run time between 0 and 2x that is picked at
//! startup, after which a random `maybe_die_with()` call site exits the
//! process.
//!
//! Each call *site* (file, line, column) is equally likely to be picked, not
//! each call, so a site on a hot path is no more likely to die than one that
//! runs once a minute.  The "die_file" and "die_line" tunables narrow the
//! candidate sites for targeted testing.

use crate::get_tunable;
use backtrace::Backtrace;
use lazy_static::lazy_static;
use log::*;
use std::{
    collections::HashSet,
    ffi::OsStr,
    fmt::Display,
    panic::Location,
    path::Path,
    sync::RwLock,
    time::{Duration, Instant},
};

lazy_static! {
    static ref RUN_TIME: Option<Duration> = get_tunable("die_mtbf_secs", None)
        .map(|secs: f64| Duration::from_secs_f64(secs * rand::random::<f64>() * 2.0));
    static ref SITES: RwLock<HashSet<&'static Location<'static>>> = Default::default();
    static ref BEGIN: Instant = Instant::now();
    // "die_file" is matched against the basename (e.g. "zilog.rs")
    static ref DIE_FILE: Option<String> = get_tunable("die_file", None);
    static ref DIE_LINE: Option<u32> = get_tunable("die_line", None);
}

/// Takes a closure producing the message rather than the message itself, so
/// that callers only pay for formatting when actually dying.
#[track_caller]
pub fn maybe_die_with<M, F>(f: F)
where
    F: FnOnce() -> M,
    M: Display,
{
    let run_time = match *RUN_TIME {
        Some(run_time) => run_time,
        None => return,
    };
    let site = Location::caller();
    if !SITES.read().unwrap().contains(site) {
        SITES.write().unwrap().insert(site);
    }
    if BEGIN.elapsed() < run_time {
        return;
    }
    // Declared here so it isn't evaluated until the run time has elapsed and
    // SITES has been populated.
    lazy_static! {
        static ref DIE_SITE: Option<&'static Location<'static>> = {
            let candidates = SITES
                .read()
                .unwrap()
                .iter()
                .filter(|site| {
                    DIE_LINE.map_or(true, |line| site.line() == line)
                        && DIE_FILE.as_ref().map_or(true, |file| {
                            Path::new(site.file()).file_name().unwrap() == OsStr::new(file)
                        })
                })
                .copied()
                .collect::<Vec<_>>();

            if candidates.is_empty() {
                warn!(
                    "after running {} seconds, no matching site to die; file:{:?} line:{:?}",
                    RUN_TIME.unwrap().as_secs(),
                    *DIE_FILE,
                    *DIE_LINE,
                );
                None
            } else {
                let die_site = candidates[rand::random::<usize>() % candidates.len()];
                warn!(
                    "after running {} seconds, selected site to die: {}",
                    RUN_TIME.unwrap().as_secs(),
                    die_site
                );
                Some(die_site)
            }
        };
    }
    if Some(site) == *DIE_SITE {
        let msg = f();
        let backtrace = Backtrace::new();
        warn!("exiting to test failure handling: {} {:?}", msg, backtrace);
        println!("exiting to test failure handling: {} {:?}", msg, backtrace);
        std::process::exit(0);
    }
}
