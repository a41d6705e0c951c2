mod bootloader;
mod cli;
mod convert;
mod distro;
mod exec;
mod image;
mod paths;
mod privileges;
mod source;
mod ui;

use clap::Parser;

use crate::cli::Cli;
use crate::ui::prelude::*;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    ui::set_debug_mode(cli.debug);
    ui::init(cli.format, !cli.no_color);

    if let Err(e) = cli::dispatch(cli.command).await {
        emit(Level::Error, "error", &format!("{e:#}"), None);
        std::process::exit(1);
    }
}
