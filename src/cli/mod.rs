pub mod args;

use clap::Parser;

pub use args::{Arguments, MergePolicy};

pub fn parse() -> Arguments {
    Arguments::parse()
}
