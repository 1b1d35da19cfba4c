use std::time::Instant;
use clap::{Arg, App, AppSettings, ArgMatches, SubCommand};
use clap::{value_t, crate_description, crate_version};
use anyhow::bail;

use xsio::bits::BitStream;
use xsio::port::{self, Port, UsbPort, XSUSB_VID, XSUSB_PID};
use xsio::jtag::JtagPort;
use xsio::hostio::HostIo;
use xsio::mem::{self, MemoryIo};
use xsio::dut::{self, DutIo};

fn main() {
    let matches = App::new("xsio")
        .version(crate_version!())
        .about(crate_description!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .global_setting(AppSettings::ColoredHelp)
        .global_setting(AppSettings::DeriveDisplayOrder)
        .global_setting(AppSettings::GlobalVersion)
        .global_setting(AppSettings::InferSubcommands)
        .global_setting(AppSettings::VersionlessSubcommands)
        .arg(Arg::with_name("quiet")
             .help("Suppress informative output")
             .long("quiet")
             .short("q")
             .global(true))
        .arg(Arg::with_name("usb")
             .help("XSUSB device instance to use")
             .long("usb")
             .short("u")
             .takes_value(true)
             .default_value("0")
             .global(true))
        .arg(Arg::with_name("module")
             .help("HostIO module id to address")
             .long("module")
             .short("m")
             .takes_value(true)
             .default_value("0")
             .global(true))
        .arg(Arg::with_name("user-instr")
             .help("JTAG USER instruction that connects the HostIO scan chain")
             .long("user-instr")
             .takes_value(true)
             .default_value("000010")
             .global(true))
        .subcommand(SubCommand::with_name("ports")
            .about("List attached XSUSB devices"))
        .subcommand(SubCommand::with_name("runtest")
            .about("Pulse the JTAG clock a number of times")
            .arg(Arg::with_name("n")
                 .help("Number of TCK pulses to generate")
                 .required(true)))
        .subcommand(SubCommand::with_name("size")
            .about("Query a memory module for its address and data widths"))
        .subcommand(SubCommand::with_name("read")
            .about("Read words from a memory module")
            .arg(Arg::with_name("addr")
                 .help("Starting address")
                 .required(true))
            .arg(Arg::with_name("count")
                 .help("Number of words to read")
                 .default_value("1")))
        .subcommand(SubCommand::with_name("write")
            .about("Write words to a memory module")
            .arg(Arg::with_name("addr")
                 .help("Starting address")
                 .required(true))
            .arg(Arg::with_name("values")
                 .help("Words to write to sequential addresses")
                 .required(true)
                 .multiple(true)))
        .subcommand(SubCommand::with_name("dut")
            .about("Access a device-under-test module")
            .setting(AppSettings::SubcommandRequiredElseHelp)
            .subcommand(SubCommand::with_name("size")
                .about("Query the DUT for its input and output vector widths"))
            .subcommand(SubCommand::with_name("read")
                .about("Read the DUT output vector"))
            .subcommand(SubCommand::with_name("write")
                .about("Force a vector onto the DUT inputs")
                .arg(Arg::with_name("bits")
                     .help("Input vector as a binary string, MSB first")
                     .required(true))))
        .get_matches();

    pretty_env_logger::init();
    let t0 = Instant::now();
    let quiet = matches.is_present("quiet");

    if let Err(e) = run(&matches) {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }
}

#[allow(clippy::cognitive_complexity)]
fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let quiet = matches.is_present("quiet");

    // Listing devices does not require opening one, so handle it first.
    if matches.subcommand_name().unwrap() == "ports" {
        print_port_list()?;
        return Ok(());
    }

    match matches.subcommand_name() {
        Some("runtest") => {
            let sub = matches.subcommand_matches("runtest").unwrap();
            let n = value_t!(sub, "n", u32).unwrap_or_else(|e| e.exit());
            let mut tap = JtagPort::new(open_port(matches)?);
            tap.run_test(n)?;
            if !quiet { println!("Pulsed TCK {} times.", n) };
        },
        Some("size") => {
            let mem = open_memory(matches)?;
            println!("Memory module: {} address bits, {} data bits.",
                     mem.addr_width(), mem.data_width());
        },
        Some("read") => {
            let sub = matches.subcommand_matches("read").unwrap();
            let addr = parse_u64(sub.value_of("addr").unwrap())?;
            let count = value_t!(sub, "count", usize).unwrap_or_else(|e| e.exit());
            let mut mem = open_memory(matches)?;
            let digits = (mem.data_width() + 3) / 4;
            for (offset, value) in mem.read(addr, count)?.iter().enumerate() {
                println!("0x{:0aw$X}: 0x{:0dw$X}",
                         addr + offset as u64, value,
                         aw = (mem.addr_width() + 3) / 4, dw = digits);
            }
        },
        Some("write") => {
            let sub = matches.subcommand_matches("write").unwrap();
            let addr = parse_u64(sub.value_of("addr").unwrap())?;
            let values = sub.values_of("values").unwrap()
                .map(parse_u64)
                .collect::<anyhow::Result<Vec<u64>>>()?;
            let mut mem = open_memory(matches)?;
            mem.write(addr, &values)?;
            if !quiet { println!("Wrote {} word(s) at 0x{:X}.", values.len(), addr) };
        },
        Some("dut") => {
            let sub = matches.subcommand_matches("dut").unwrap();
            let mut dut = open_dut(matches)?;
            match sub.subcommand_name() {
                Some("size") => {
                    println!("DUT module: {} input bits, {} output bits.",
                             dut.input_width(), dut.output_width());
                },
                Some("read") => {
                    println!("{}", dut.read()?);
                },
                Some("write") => {
                    let sub = sub.subcommand_matches("write").unwrap();
                    let vector: BitStream = sub.value_of("bits").unwrap().parse()?;
                    dut.write(&vector)?;
                    if !quiet { println!("Forced {} bit(s) onto DUT inputs.", vector.len()) };
                },
                _ => panic!("Unhandled dut subcommand."),
            }
        },
        _ => panic!("Unhandled command."),
    }

    Ok(())
}

/// Open the selected XSUSB device instance.
fn open_port(matches: &ArgMatches) -> anyhow::Result<UsbPort> {
    let usb = value_t!(matches, "usb", u32).unwrap_or_else(|e| e.exit());
    let mut port = UsbPort::xsusb(usb);
    port.open(1)?;
    Ok(port)
}

/// Open a memory session on the selected device and module.
fn open_memory(matches: &ArgMatches) -> anyhow::Result<MemoryIo<UsbPort>> {
    let module = value_t!(matches, "module", u8).unwrap_or_else(|e| e.exit());
    let user_instr: BitStream = matches.value_of("user-instr").unwrap().parse()?;
    let mut hostio = HostIo::new(JtagPort::new(open_port(matches)?));
    hostio.set_user_instr(user_instr);
    let mut mem = MemoryIo::new(hostio);
    mem.reset()?;
    let (addr_width, data_width) = mem.get_size(module)?;
    if addr_width == 0 || data_width == 0 {
        bail!("memory module {} not present (zero widths)", module);
    }
    Ok(mem)
}

/// Open a DUT session on the selected device and module.
fn open_dut(matches: &ArgMatches) -> anyhow::Result<DutIo<UsbPort>> {
    let module = value_t!(matches, "module", u8).unwrap_or_else(|e| e.exit());
    let user_instr: BitStream = matches.value_of("user-instr").unwrap().parse()?;
    let mut hostio = HostIo::new(JtagPort::new(open_port(matches)?));
    hostio.set_user_instr(user_instr);
    let mut dut = DutIo::new(hostio);
    dut.reset()?;
    let (input_width, output_width) = dut.get_size(module)?;
    if input_width == 0 && output_width == 0 {
        bail!("DUT module {} not present (zero widths)", module);
    }
    Ok(dut)
}

fn print_port_list() -> anyhow::Result<()> {
    let count = UsbPort::count(XSUSB_VID, XSUSB_PID)?;
    if count == 0 {
        println!("No XSUSB devices found.");
    } else {
        println!("Found {} XSUSB device{}:", count, if count == 1 { "" } else { "s" });
        for instance in 0..count {
            println!("  {}: {:04x}:{:04x}", instance, XSUSB_VID, XSUSB_PID);
        }
    }
    Ok(())
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
fn parse_u64(s: &str) -> anyhow::Result<u64> {
    if s.starts_with("0x") || s.starts_with("0X") {
        Ok(u64::from_str_radix(&s[2..], 16)?)
    } else {
        Ok(s.parse()?)
    }
}

/// Collapse errors to the script-facing status codes: 2 for a short or
/// mismatched result, 1 for any other failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(mem::Error::WrongReplyLength { .. }) = cause.downcast_ref() {
            return 2;
        }
        if let Some(dut::Error::WrongReplyLength { .. }) = cause.downcast_ref() {
            return 2;
        }
        if let Some(port::Error::ShortRead { .. }) = cause.downcast_ref() {
            return 2;
        }
    }
    1
}
