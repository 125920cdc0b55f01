use clap::{Parser, Subcommand};
use lockmux::{
    ClientConfig, ConnectionType, Device, Error, LookupMode, UsbMuxClient,
    logging::{self, LogConfig},
};

#[derive(Parser)]
#[command(name = "lockmux")]
#[command(about = "Talk to iOS devices through usbmuxd and lockdownd")]
struct Args {
    /// Log at debug level, overriding LOCKMUX_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    /// usbmuxd address, `UNIX:/path` or `host:port`
    #[arg(long, global = true, env = "USBMUXD_SOCKET_ADDRESS")]
    socket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices
    List,
    /// Print attach and detach events until interrupted
    Listen,
    /// Query a lockdown value
    Info {
        /// Device to query, the first USB device when omitted
        #[arg(short, long)]
        udid: Option<String>,
        #[arg(short, long)]
        domain: Option<String>,
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Print the daemon's system BUID
    Buid,
    /// Print the pair record stored for a device
    PairRecord { udid: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = if args.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    logging::init_logging_with_config(log_config)?;

    let mut config = ClientConfig::new();
    if let Some(socket) = &args.socket {
        config = config.with_address(lockmux::UsbMuxAddress::parse(socket)?);
    }
    let usbmux = UsbMuxClient::new(config);

    match args.command {
        Commands::List => {
            for device in usbmux.list_devices().await? {
                println!(
                    "{}\t{}\t{}",
                    device.udid, device.connection_type, device.handle
                );
            }
        }

        Commands::Listen => {
            let mut events = usbmux.subscribe().await?;

            loop {
                tokio::select! {
                    event = events.next_event() => match event {
                        Some(event) => println!(
                            "{:?}\t{}\t{}",
                            event.kind, event.device.udid, event.device.connection_type
                        ),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::Info { udid, domain, key } => {
            let udid = match udid {
                Some(udid) => udid,
                None => first_usb_device(&usbmux).await?,
            };

            let device = Device::new(usbmux, udid, LookupMode::default());
            let mut lockdown = device.lockdown_session().await?;

            let value = lockdown.get_value(domain.as_deref(), key.as_deref()).await?;
            value.to_writer_xml(std::io::stdout())?;
            println!();

            lockdown.goodbye().await?;
        }

        Commands::Buid => println!("{}", usbmux.read_buid().await?),

        Commands::PairRecord { udid } => {
            let bytes = usbmux.read_pair_record(&udid).await?;
            let record = lockmux::PairRecord::from_bytes(&bytes)?;

            println!("HostID\t{}", record.host_id);
            println!("SystemBUID\t{}", record.system_buid);
            if let Some(mac) = &record.wifi_mac_address {
                println!("WiFiMACAddress\t{mac}");
            }
            println!("EscrowBag\t{}", record.escrow_bag.is_some());
        }
    }

    Ok(())
}

async fn first_usb_device(usbmux: &UsbMuxClient) -> lockmux::Result<String> {
    usbmux
        .list_devices()
        .await?
        .into_iter()
        .find(|d| d.connection_type == ConnectionType::Usb)
        .map(|d| d.udid)
        .ok_or_else(|| Error::NotFound("no USB device attached".into()))
}
