use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "bmsgw",
    version,
    about = r#"
bmsgw bridges a battery management controller on a serial link to MQTT and HTTP.

EXAMPLES:
    # Run the gateway with a configuration file:
    bmsgw --config gateway.json run

    # One-shot register access by key or address:
    bmsgw read cell_0_v
    bmsgw read 0x012C
    bmsgw write fully_charged_voltage_mv 4200

    # Ask the controller to restart:
    bmsgw restart

    # Decode a captured frame:
    bmsgw decode "AA 09 04 00 00 68 10 CE 5F"
"#
)]
pub struct Opt {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Run the full gateway: poller, telemetry publisher, MQTT, status.
    Run,

    /// Read one register and print its raw and user-space value.
    Read(ReadArgs),

    /// Write a user-space value to one register, with read-back.
    Write(WriteArgs),

    /// Send the controller restart command.
    Restart,

    /// Decode a hex byte string as a response frame.
    Decode(DecodeArgs),
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Register key (e.g. cell_0_v) or address (decimal or 0x-hex).
    pub register: String,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Register key or address; must be writable.
    pub register: String,

    /// User-space value (register units, e.g. millivolts).
    pub value: f64,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Hex bytes, whitespace optional: "AA0104..." or "AA 01 04 ...".
    pub bytes: String,
}
