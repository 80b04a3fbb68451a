//! Module defining the command line usage.
//!
//! The installer is normally started by the recovery init scripts, which
//! translate the `runinstaller` word on the kernel command line into the
//! `--runinstaller` flag. The other flags exist for bench use.

use clap::{ArgAction, Parser};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cmdline {
	/// Force setup mode on this boot.
	#[arg(long, action = ArgAction::SetTrue)]
	pub runinstaller: bool,

	/// Record the given partition device as the default boot target before
	/// the boot decision is made.
	#[arg(long)]
	pub partition: Option<String>,

	/// Start the interactive menu instead of the HTTP listener.
	#[arg(long = "no-webserver", action = ArgAction::SetTrue)]
	pub no_webserver: bool,

	/// Turns on debug output.
	#[arg(long, action = ArgAction::SetTrue)]
	pub debug: bool,
}
