pub mod run {
    use std::path::PathBuf;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use crate::csc::{Csc, InitialState, Overrides, Settings, Timing};
    use crate::mqtt;

    /// Commands the component may have queued before it gets around to executing them.
    const COMMAND_QUEUE: usize = 16;

    /// Run the MTAirCompressor CSC.
    #[derive(clap::Parser)]
    #[clap(version, about, author)]
    pub struct Args {
        /// CSC index. Selects the compressor and its configuration instance.
        index: u16,

        /// Summary state to reach right after startup.
        #[arg(long, value_enum, default_value = "standby")]
        state: InitialState,

        /// Configuration override file, used when `--state` is disabled or enabled.
        #[arg(long = "override", default_value = "")]
        configuration_override: String,

        /// Talk to the built-in compressor simulator instead of the real hardware.
        #[arg(long, short = 's')]
        simulate: bool,

        /// Directory holding `_init.yaml` and override files.
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,

        /// TCP/IP connection grace period in seconds. Defaults to 60 minutes (3600 seconds).
        #[arg(long)]
        grace_period: Option<u64>,

        /// Hostname of the compressor ModbusRTU/TCP convertor.
        ///
        /// Unless specified, m1m3cam-aircompNN.cp.lsst.org, where NN is the compressor index.
        #[arg(long)]
        host: Option<String>,

        /// TCP/IP port of the compressor ModbusRTU/TCP convertor. Defaults to 502.
        #[arg(long)]
        port: Option<u16>,

        /// Modbus unit address. Defaults to the compressor index.
        #[arg(long)]
        unit: Option<u8>,

        /// Consider a modbus request failed if no response is received in this amount of time.
        #[arg(long, default_value = "3s")]
        modbus_timeout: humantime::Duration,

        #[clap(flatten)]
        mqtt: mqtt::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the MQTT bridge task failed")]
        Bridge(#[source] tokio::task::JoinError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(serve(args))
    }

    async fn serve(args: Args) -> Result<(), Error> {
        let shutdown = CancellationToken::new();
        tokio::task::spawn(watch_signals(shutdown.clone()));

        let settings = Settings {
            index: args.index,
            simulation_mode: args.simulate,
            config_dir: args.config_dir,
            overrides: Overrides {
                host: args.host,
                port: args.port,
                unit: args.unit,
                grace_period: args.grace_period,
            },
            modbus_timeout: *args.modbus_timeout,
            timing: Timing::default(),
        };
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE);
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let bridge =
            tokio::task::spawn(mqtt::run(args.mqtt, args.index, command_sender, outbound_receiver));
        info!(message = "starting", index = args.index, simulate = args.simulate);
        Csc::new(settings, outbound_sender)
            .run(args.state, &args.configuration_override, command_receiver, shutdown)
            .await;
        bridge.await.map_err(Error::Bridge)
    }

    async fn watch_signals(shutdown: CancellationToken) {
        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    terminate.recv().await;
                }
                Err(e) => {
                    {
                        let error = &e as &dyn std::error::Error;
                        warn!(message = "cannot watch for SIGTERM", error);
                    }
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    let error = &e as &dyn std::error::Error;
                    warn!(message = "cannot watch for Ctrl-C", error);
                    return;
                }
            }
            _ = terminate => {}
        }
        info!("termination requested");
        shutdown.cancel();
    }
}
