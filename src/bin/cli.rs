//! Amlburn command line interface.

use std::fs::File;
use std::process;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
};
use console::style;
use log::{debug, error, LevelFilter};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use simplelog::*;

use amlburn as ab;

fn main() {
    println!("[AB] amlburn v{}", crate_version!());

    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(1);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Amlburn flashes a firmware image onto an Amlogic board over its \
            serial console, with no human at the keyboard. It watches the \
            board's boot messages, stops the U-Boot autoboot countdown, puts \
            the board into USB download mode and runs the vendor \
            `adnl_burn_pkg` tool to perform the burn. Once the tool reports \
            success, amlburn keeps watching the console until the freshly \
            flashed system boots a kernel.\n\
            \n\
            Boards that are already booted into Linux are rebooted first, \
            and a network power relay can be used to power-cycle the board \
            before starting.\n\
            \n\
            Exit codes: 0 on success, 2 for configuration problems, 3 when \
            a timeout fired, 1 for everything else.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device connected to the board's console")
                .long_help(
                    "the USB tty device connected to the board's console; \
                     may change when the board is unplugged and re-plugged \
                     and may differ between systems.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .required(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .long_help("serial baud rate; Amlogic consoles run at 921600")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("921600")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .default_value("8")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .default_value("1")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("RELAY")
                .help("address of a Tasmota power relay controlling the board")
                .long_help(
                    "address of a Tasmota power relay controlling the board; \
                     when set, the board is power-cycled before the burn \
                     starts instead of being rebooted over the console.",
                )
                .short("-r")
                .long("--relay")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("IMAGE")
                .help("path to the firmware image package to burn")
                .required(true)
                .index(1),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'amlburn -v -v -v' or 'amlburn -vvv' vs 'amlburn -v'
    let log_level: LevelFilter;
    match matches.occurrences_of("v") {
        0 => log_level = LevelFilter::Info,
        1 => log_level = LevelFilter::Debug,
        _ => log_level = LevelFilter::Trace,
    }

    // Everything goes to the terminal at the requested verbosity and to a
    // per-session log file at full detail, so a failed burn can be
    // analyzed after the fact.
    let log_name = format!("amlburn-{}.log", chrono::Local::now().format("%Y%m%d-%H%M%S"));
    let log_file = File::create(&log_name).unwrap_or_else(|e| {
        println!(
            "{}: cannot create the session log `{}`: {}",
            style("error").red(),
            style(&log_name).cyan(),
            e
        );
        process::exit(2);
    });
    CombinedLogger::init(vec![
        TermLogger::new(
            log_level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Trace, Config::default(), log_file),
    ])
    .unwrap();
    debug!("session log: {}", log_name);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style("baud-rate").cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of("BAUD_RATE").unwrap()).on_red()
        );
        process::exit(2);
    });

    let data_bits = match matches.value_of("DATA_BITS").unwrap() {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        "8" => DataBits::Eight,
        _ => unreachable!(),
    };

    let stop_bits = match matches.value_of("STOP_BITS").unwrap() {
        "1" => StopBits::One,
        "2" => StopBits::Two,
        _ => unreachable!(),
    };

    let parity = match matches.value_of("PARITY").unwrap() {
        "none" => Parity::None,
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => unreachable!(),
    };

    let flow_control = match matches.value_of("FLOW_CONTROL").unwrap() {
        "none" => FlowControl::None,
        "soft" => FlowControl::Software,
        "hard" => FlowControl::Hardware,
        _ => unreachable!(),
    };

    // END - Arguments with default values =====================================

    let mut settings = ab::SettingsBuilder::default()
        .baud_rate(baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .path(matches.value_of("DEVICE_TTY").unwrap())
        .image(matches.value_of("IMAGE").unwrap())
        .finalize();

    if matches.is_present("RELAY") {
        settings.relay = Some(matches.value_of("RELAY").unwrap().into());
    }

    // Run the burn ============================================================

    let mut engine = ab::factory(settings);
    match engine.run() {
        Ok(()) => {
            println!("{} burn completed", style("✔").green());
            process::exit(0);
        }
        Err(err) => {
            error!("{}", err);
            println!("{} {}", style("✘").red(), err);
            let code = err.exit_code();
            debug!("exit code: {}", code);
            process::exit(code);
        }
    }
}
