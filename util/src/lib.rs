#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![warn(clippy::cast_sign_loss)]

mod die;
mod tunable;

pub use die::maybe_die_with;
pub use tunable::get_tunable;
pub use tunable::read_tunable_config;
