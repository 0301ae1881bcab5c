#![forbid(unsafe_code)]

use std::net::{TcpListener, UdpSocket};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use pciefw::shadow::MSI_CAP_OFFSET;
use pciefw::{
    AccessWidth, BarWindow, DatagramTransport, DeviceHost, DispatchOutcome, DmaError, Endpoint,
    MsiMessage, PciefwConfig, PciefwDevice, RamDevice, StreamTransport, TransactionError,
    TransportError, TransportKind,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "pciefw",
    about = "Talk to a remote PCI endpoint over the pciefw link protocol."
)]
struct Cli {
    /// Local bind address (datagram transport only) [env: PCIEFW_LADDR]
    #[arg(long, global = true, value_name = "ADDR")]
    laddr: Option<String>,

    /// Local bind port (datagram transport only) [env: PCIEFW_LPORT]
    #[arg(long, global = true, value_name = "PORT")]
    lport: Option<u16>,

    /// Remote endpoint address [env: PCIEFW_RADDR]
    #[arg(long, global = true, value_name = "ADDR")]
    raddr: Option<String>,

    /// Remote endpoint port [env: PCIEFW_RPORT]
    #[arg(long, global = true, value_name = "PORT")]
    rport: Option<u16>,

    /// Link transport: `stream` (TCP) or `datagram` (UDP) [env: PCIEFW_TRANSPORT]
    #[arg(long, global = true, value_name = "KIND")]
    transport: Option<TransportKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach, print the discovered BAR table and detach
    Probe,

    /// Read the remote configuration space
    ConfigRead {
        #[arg(value_parser = parse_num::<u64>)]
        offset: u64,
        /// Access width in bytes (1, 2 or 4)
        #[arg(long, default_value = "4", value_parser = parse_config_width)]
        width: AccessWidth,
    },

    /// Write the remote configuration space
    ConfigWrite {
        #[arg(value_parser = parse_num::<u64>)]
        offset: u64,
        #[arg(value_parser = parse_num::<u64>)]
        value: u64,
        /// Access width in bytes (1, 2 or 4)
        #[arg(long, default_value = "4", value_parser = parse_config_width)]
        width: AccessWidth,
    },

    /// Read from a BAR (memory or I/O, as discovered)
    Read {
        bar: u8,
        #[arg(value_parser = parse_num::<u64>)]
        offset: u64,
        #[arg(long, default_value = "4", value_parser = parse_width)]
        width: AccessWidth,
    },

    /// Write to a BAR (memory or I/O, as discovered)
    Write {
        bar: u8,
        #[arg(value_parser = parse_num::<u64>)]
        offset: u64,
        #[arg(value_parser = parse_num::<u64>)]
        value: u64,
        #[arg(long, default_value = "4", value_parser = parse_width)]
        width: AccessWidth,
    },

    /// Print remote-initiated DMA writes and interrupts as they arrive
    Watch {
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,

        /// Program and enable the MSI capability with this address before watching
        #[arg(long, value_parser = parse_num::<u32>, requires = "msi_data")]
        msi_address: Option<u32>,

        /// MSI data value to program alongside --msi-address
        #[arg(long, value_parser = parse_num::<u16>)]
        msi_data: Option<u16>,
    },

    /// Emulate a remote endpoint with RAM-backed BARs, listening on the remote address
    Serve {
        /// Memory BAR as INDEX:SIZE (repeatable; default 0:0x1000)
        #[arg(long = "mem-bar", value_name = "INDEX:SIZE", value_parser = parse_bar_arg)]
        mem_bars: Vec<(u8, u64)>,

        /// I/O BAR as INDEX:SIZE (repeatable)
        #[arg(long = "io-bar", value_name = "INDEX:SIZE", value_parser = parse_bar_arg)]
        io_bars: Vec<(u8, u64)>,

        /// Exit after serving this many connections (stream transport)
        #[arg(long)]
        connections: Option<usize>,
    },
}

/// Host for one-shot commands: prints remote events to stdout.
#[derive(Debug, Default)]
struct ConsoleHost {
    events: usize,
}

impl DeviceHost for ConsoleHost {
    fn map_bar(&mut self, window: BarWindow) {
        info!(bar = window.index, kind = ?window.kind, size = window.size, "mapping BAR");
    }

    fn unmap_bar(&mut self, index: u8) {
        info!(bar = index, "unmapping BAR");
    }

    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        self.events += 1;
        println!("dma 0x{addr:016x} {}", hex(data));
        Ok(())
    }

    fn raise_msi(&mut self, message: MsiMessage) {
        self.events += 1;
        println!(
            "msi address=0x{:08x} data=0x{:04x}",
            message.address, message.data
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = link_config(&cli)?;
    run(cli.command, &config)
}

fn link_config(cli: &Cli) -> anyhow::Result<PciefwConfig> {
    let mut config = PciefwConfig::from_env().context("invalid PCIEFW_* environment")?;
    if let Some(addr) = &cli.laddr {
        config.local_addr = addr.clone();
    }
    if let Some(port) = cli.lport {
        config.local_port = port;
    }
    if let Some(addr) = &cli.raddr {
        config.remote_addr = addr.clone();
    }
    if let Some(port) = cli.rport {
        config.remote_port = port;
    }
    if let Some(kind) = cli.transport {
        config.transport = kind;
    }
    Ok(config)
}

fn attach(config: &PciefwConfig, host: &mut ConsoleHost) -> anyhow::Result<PciefwDevice> {
    PciefwDevice::attach(config, host).with_context(|| {
        format!(
            "attach to {}:{} over {:?}",
            config.remote_addr, config.remote_port, config.transport
        )
    })
}

fn run(command: Command, config: &PciefwConfig) -> anyhow::Result<()> {
    if let Command::Serve {
        mem_bars,
        io_bars,
        connections,
    } = &command
    {
        let dev = build_ram_device(mem_bars, io_bars)?;
        return serve(config, dev, *connections);
    }

    let mut host = ConsoleHost::default();
    let mut dev = attach(config, &mut host)?;

    match command {
        Command::Probe => {
            for index in 0..6u8 {
                match dev.bars().get(index) {
                    Some(window) => println!(
                        "BAR{index}  {:<6}  size 0x{:x}",
                        format!("{:?}", window.kind).to_lowercase(),
                        window.size
                    ),
                    None => println!("BAR{index}  unused"),
                }
            }
        }
        Command::ConfigRead { offset, width } => {
            let value = dev
                .session_mut()
                .read_config(offset, width)
                .with_context(|| format!("config read at 0x{offset:x}"))?;
            println!("0x{value:0digits$x}", digits = width.bytes() * 2);
        }
        Command::ConfigWrite {
            offset,
            value,
            width,
        } => {
            dev.session_mut()
                .write_config(offset, width, value & width.mask())
                .with_context(|| format!("config write at 0x{offset:x}"))?;
        }
        Command::Read { bar, offset, width } => {
            let window = mapped_bar(&dev, bar)?;
            let res = match window.kind {
                pciefw::BarKind::Memory => dev.session_mut().read_mem(bar, offset, width),
                pciefw::BarKind::Io => dev.session_mut().read_io(bar, offset, width),
            };
            let value = res.with_context(|| format!("BAR{bar} read at 0x{offset:x}"))?;
            println!("0x{value:0digits$x}", digits = width.bytes() * 2);
        }
        Command::Write {
            bar,
            offset,
            value,
            width,
        } => {
            let window = mapped_bar(&dev, bar)?;
            let value = value & width.mask();
            let res = match window.kind {
                pciefw::BarKind::Memory => dev.session_mut().write_mem(bar, offset, width, value),
                pciefw::BarKind::Io => dev.session_mut().write_io(bar, offset, width, value),
            };
            res.with_context(|| format!("BAR{bar} write at 0x{offset:x}"))?;
        }
        Command::Watch {
            count,
            msi_address,
            msi_data,
        } => {
            if let (Some(address), Some(data)) = (msi_address, msi_data) {
                dev.config_write(MSI_CAP_OFFSET + 4, 4, address);
                dev.config_write(MSI_CAP_OFFSET + 8, 2, u32::from(data));
                dev.config_write(MSI_CAP_OFFSET + 2, 2, 1);
            }
            watch(&mut dev, &mut host, count)?;
        }
        Command::Serve { .. } => bail!("serve does not attach to a device"),
    }

    drop(dev.detach(&mut host));
    Ok(())
}

fn mapped_bar(dev: &PciefwDevice, bar: u8) -> anyhow::Result<BarWindow> {
    dev.bars()
        .get(bar)
        .ok_or_else(|| anyhow!("BAR{bar} is not implemented by the remote endpoint"))
}

fn watch(
    dev: &mut PciefwDevice,
    host: &mut ConsoleHost,
    count: Option<usize>,
) -> anyhow::Result<()> {
    loop {
        if count.is_some_and(|count| host.events >= count) {
            return Ok(());
        }
        match dev.wait_readable() {
            Ok(()) => {}
            Err(TransportError::Closed) => {
                info!("remote endpoint closed the link");
                return Ok(());
            }
            Err(err) => return Err(err).context("waiting for remote events"),
        }
        loop {
            match dev.on_readable(host) {
                DispatchOutcome::Ignored(opcode) => println!("ignored {opcode}"),
                DispatchOutcome::Failed => bail!("link failed while receiving remote event"),
                _ => {}
            }
            if !dev.has_queued_events() {
                break;
            }
        }
    }
}

fn build_ram_device(mem_bars: &[(u8, u64)], io_bars: &[(u8, u64)]) -> anyhow::Result<RamDevice> {
    let mut builder = RamDevice::builder();
    let default_bar = [(0u8, 0x1000u64)];
    let mem_bars = if mem_bars.is_empty() && io_bars.is_empty() {
        &default_bar[..]
    } else {
        mem_bars
    };
    for &(index, size) in mem_bars {
        check_bar(index, size)?;
        builder = builder.mem_bar(index, size);
    }
    for &(index, size) in io_bars {
        check_bar(index, size)?;
        builder = builder.io_bar(index, size);
    }
    Ok(builder.build())
}

fn check_bar(index: u8, size: u64) -> anyhow::Result<()> {
    if index >= 6 {
        bail!("BAR index {index} out of range (0-5)");
    }
    if !size.is_power_of_two() || size < 16 || size > 0x8000_0000 {
        bail!("BAR size 0x{size:x} must be a power of two between 0x10 and 0x80000000");
    }
    Ok(())
}

fn serve(config: &PciefwConfig, mut dev: RamDevice, connections: Option<usize>) -> anyhow::Result<()> {
    let listen = config.remote_socket_addr()?;
    match config.transport {
        TransportKind::Stream => {
            let listener =
                TcpListener::bind(listen).with_context(|| format!("listen on {listen}"))?;
            info!(%listen, "serving pciefw endpoint");
            let mut served = 0usize;
            while connections.map_or(true, |max| served < max) {
                let (stream, peer) = listener.accept().context("accept connection")?;
                info!(%peer, "device attached");
                let mut endpoint = Endpoint::new(StreamTransport::new(stream));
                serve_link(&mut endpoint, &mut dev);
                info!(%peer, "device detached");
                served += 1;
            }
            Ok(())
        }
        TransportKind::Datagram => {
            let peer = config.local_socket_addr()?;
            let socket = UdpSocket::bind(listen).with_context(|| format!("bind {listen}"))?;
            socket
                .connect(peer)
                .with_context(|| format!("connect to {peer}"))?;
            info!(%listen, %peer, "serving pciefw endpoint");
            let mut endpoint = Endpoint::new(DatagramTransport::new(socket));
            serve_link(&mut endpoint, &mut dev);
            Ok(())
        }
    }
}

fn serve_link<T: pciefw::Transport>(endpoint: &mut Endpoint<T>, dev: &mut RamDevice) {
    loop {
        match endpoint.serve_one(dev) {
            Ok(_) => {}
            Err(TransactionError::Transport(TransportError::Closed)) => return,
            Err(err) => {
                warn!(%err, "dropping link");
                return;
            }
        }
    }
}

fn parse_num<T: TryFrom<u64>>(s: &str) -> Result<T, String> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u64>(),
    }
    .map_err(|err| format!("invalid number {s:?}: {err}"))?;
    T::try_from(value).map_err(|_| format!("{s} is out of range"))
}

fn parse_width(s: &str) -> Result<AccessWidth, String> {
    let n = parse_num::<usize>(s)?;
    AccessWidth::from_bytes(n).ok_or_else(|| format!("invalid width {n} (expected 1, 2, 4 or 8)"))
}

/// Configuration space accesses are at most a dword.
fn parse_config_width(s: &str) -> Result<AccessWidth, String> {
    match parse_width(s)? {
        AccessWidth::Qword => Err("configuration accesses are 1, 2 or 4 bytes".to_owned()),
        width => Ok(width),
    }
}

fn parse_bar_arg(s: &str) -> Result<(u8, u64), String> {
    let (index, size) = s
        .split_once(':')
        .ok_or_else(|| format!("expected INDEX:SIZE, got {s:?}"))?;
    Ok((parse_num::<u8>(index)?, parse_num::<u64>(size)?))
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
