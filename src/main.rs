mod boot;
mod cli;
mod fetch;
mod image;
mod install;
mod manifest;
mod planner;
mod postinstall;
mod presetup;
mod server;
mod state;
mod table;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cmdline;
use log::{debug, error, info};
use owo_colors::colored::*;

use crate::boot::BootManager;

fn main() -> Result<()> {
	ctrlc::set_handler(move || {
		eprintln!("\nReceived Ctrl-C, exiting.");
		std::process::exit(1);
	})
	.context("Can not register Ctrl-C (SIGTERM) handler.")?;

	// Parse the command line
	let cmdline = Cmdline::try_parse()?;
	let mut logger = colog::basic_builder();
	if cmdline.debug {
		logger.filter(None, log::LevelFilter::Debug);
	} else {
		logger.filter(None, log::LevelFilter::Info);
	}
	logger.init();
	if cmdline.debug {
		debug!("Debug output enabled.");
	}
	if let Err(e) = try_main(cmdline) {
		// Use the logger to pretty-print errors
		let mut str_buf = String::new();
		error!("Error encountered!\n{}", e.to_string().bright_red());
		let mut ident = 0;
		e.chain().skip(1).for_each(|cause| {
			let ident_str = "\t".repeat(ident);
			ident += 1;
			str_buf += &format!("{0}- Caused by:\n{0}  {1}", ident_str, cause);
		});
		if !str_buf.is_empty() {
			error!("{}", str_buf);
		}
		error!("Exiting now.");
		std::process::exit(1);
	}
	Ok(())
}

fn try_main(cmdline: Cmdline) -> Result<()> {
	info!("Welcome to mmcinstall!");
	let boot_manager = BootManager::new(&cmdline);
	boot_manager.run(&cmdline)
}
