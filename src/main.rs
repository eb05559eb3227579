use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use bmsgw::alerts::AlertTask;
use bmsgw::bus::{Event, EventBus};
use bmsgw::cache::{ModelBuilder, RegisterCache};
use bmsgw::catalog::{Access, Catalog};
use bmsgw::cli;
use bmsgw::config::Config;
use bmsgw::error::{Error, Result};
use bmsgw::mqtt::{start_event_bridge, MetricsSink, MqttGateway};
use bmsgw::poller::Poller;
use bmsgw::proto::frame::FrameDecoder;
use bmsgw::serial::engine::{SerialEngine, SerialHandle};
use bmsgw::serial::link::SerialPortLink;
use bmsgw::status::{StatusReporter, StatusSources};
use bmsgw::telemetry::{HttpSink, Publisher, PublisherCore, SampleSink};

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();
    let config = match load_config(opt.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let result = match opt.action {
        cli::Action::Run => do_run(&config),
        cli::Action::Read(args) => do_read(&config, &args),
        cli::Action::Write(args) => do_write(&config, &args),
        cli::Action::Restart => do_restart(&config),
        cli::Action::Decode(args) => do_decode(&args),
    };
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

/// Everything a one-shot command needs: the bus, the cache and a running
/// serial worker.
struct CoreStack {
    bus: Arc<EventBus>,
    cache: Arc<RegisterCache>,
    serial: SerialHandle,
    serial_join: thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl CoreStack {
    fn bring_up(config: &Config) -> Result<CoreStack> {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(RegisterCache::new(
            Arc::new(Catalog::new()),
            Arc::clone(&bus),
            config.publish_timeout(),
        ));
        let link = SerialPortLink::open(&config.serial.port, config.serial.baud_rate)?;
        let stop = Arc::new(AtomicBool::new(false));
        let (serial, serial_join) = SerialEngine::start(
            Box::new(link),
            Arc::clone(&cache),
            config.serial_settings(),
            Arc::clone(&stop),
        );
        Ok(CoreStack {
            bus,
            cache,
            serial,
            serial_join,
            stop,
        })
    }

    fn tear_down(self) {
        self.stop.store(true, Ordering::Relaxed);
        drop(self.serial);
        let _ = self.serial_join.join();
    }
}

fn do_run(config: &Config) -> Result<()> {
    let core = CoreStack::bring_up(config)?;
    log::info!(
        "gateway running: device {}, serial port {}",
        config.device_id,
        config.serial.port
    );

    let stop = Arc::clone(&core.stop);
    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || {
            log::info!("shutting down");
            stop.store(true, Ordering::Relaxed);
        }
    })
    .map_err(|e| Error::Config(format!("could not install Ctrl+C handler: {e}")))?;

    let model = Arc::new(ModelBuilder::new(
        Arc::clone(&core.cache),
        Arc::clone(&core.bus),
        config.model_freshness(),
        config.publish_timeout(),
    ));

    // Subscriptions are taken before the poller starts publishing so the
    // first cycle's snapshots reach everyone.
    let queue_capacity = config.bus.queue_capacity;
    let telemetry_sub = core.bus.subscribe("telemetry", queue_capacity);
    let alerts_sub = core.bus.subscribe("alerts", queue_capacity);
    let mqtt_sub = core.bus.subscribe("mqtt", queue_capacity);

    let mqtt_gateway = if config.mqtt.enabled {
        Some(Arc::new(MqttGateway::new(config.mqtt_settings()?)?))
    } else {
        None
    };

    let mut sinks: Vec<Box<dyn SampleSink>> = Vec::new();
    if let Some(endpoint) = &config.telemetry.http_endpoint {
        sinks.push(Box::new(HttpSink::new(
            endpoint.clone(),
            Duration::from_millis(config.telemetry.http_timeout_ms),
        )?));
    }
    if let Some(gateway) = &mqtt_gateway {
        sinks.push(Box::new(MetricsSink::new(Arc::clone(gateway))));
    }

    let (poller, poller_join) = Poller::start(
        core.serial.clone(),
        Arc::clone(&model),
        config.poller_settings(),
        Arc::clone(&core.stop),
    );

    let (publisher, publisher_join) = Publisher::start(
        telemetry_sub,
        PublisherCore::new(sinks, config.publisher_settings()),
        Arc::clone(&core.stop),
    );

    let bridge_join = mqtt_gateway
        .as_ref()
        .map(|gateway| start_event_bridge(Arc::clone(gateway), mqtt_sub, Arc::clone(&core.stop)));

    let alerts_join = AlertTask::start(
        Arc::clone(&core.bus),
        alerts_sub,
        config.alerts.clone(),
        config.publish_timeout(),
        Arc::clone(&core.stop),
    );

    let status_join = StatusReporter::start(
        StatusSources {
            bus: Arc::clone(&core.bus),
            serial: core.serial.clone(),
            poller: Some(poller.clone()),
            publisher: Some(publisher.clone()),
            mqtt: mqtt_gateway.as_ref().map(Arc::clone),
        },
        config.status_settings(),
        Arc::clone(&core.stop),
    );

    // Link management is an external concern; from this process's point of
    // view the link is up once everything is wired.
    core.bus.publish(&Event::LinkUp, config.publish_timeout())?;

    while !core.stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    // Shutdown in reverse of bring-up.
    let _ = status_join.join();
    let _ = alerts_join.join();
    if let Some(join) = bridge_join {
        let _ = join.join();
    }
    if let Some(gateway) = &mqtt_gateway {
        let _ = gateway.stop();
    }
    let _ = publisher_join.join();
    poller.trigger_now();
    let _ = poller_join.join();
    core.tear_down();
    log::info!("gateway stopped");
    Ok(())
}

fn do_read(config: &Config, args: &cli::ReadArgs) -> Result<()> {
    let catalog = Catalog::new();
    let descriptor = catalog.resolve(&args.register)?;
    if descriptor.access == Access::WriteOnly {
        return Err(Error::NotReadable(descriptor.key));
    }

    let core = CoreStack::bring_up(config)?;
    let result = core.serial.read(descriptor.address);
    core.tear_down();

    let raw = result?;
    let user = descriptor.raw_to_user(raw);
    println!(
        "{} (0x{:04X}): raw {} -> {} {}",
        descriptor.key, descriptor.address, raw, user, descriptor.unit
    );
    Ok(())
}

fn do_write(config: &Config, args: &cli::WriteArgs) -> Result<()> {
    let catalog = Catalog::new();
    let descriptor = catalog.resolve(&args.register)?;
    if descriptor.access == Access::ReadOnly {
        return Err(Error::NotWritable(descriptor.key));
    }
    let raw = descriptor.user_to_raw(args.value)?;

    let core = CoreStack::bring_up(config)?;
    let result = core.serial.write(descriptor.address, raw);
    let read_back = core.cache.get(descriptor.address);
    core.tear_down();

    result?;
    match read_back {
        Some(entry) => println!(
            "{} (0x{:04X}): wrote raw {}, controller reports {} ({} {})",
            descriptor.key, descriptor.address, raw, entry.raw, entry.user, descriptor.unit
        ),
        None => println!(
            "{} (0x{:04X}): wrote raw {} (no read-back)",
            descriptor.key, descriptor.address, raw
        ),
    }
    Ok(())
}

fn do_restart(config: &Config) -> Result<()> {
    let core = CoreStack::bring_up(config)?;
    let result = core.serial.restart();
    core.tear_down();
    result?;
    println!("controller restart acknowledged");
    Ok(())
}

fn do_decode(args: &cli::DecodeArgs) -> Result<()> {
    let cleaned: String = args.bytes.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err(Error::Config("odd number of hex digits".into()));
    }
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    for i in (0..cleaned.len()).step_by(2) {
        let byte = u8::from_str_radix(&cleaned[i..i + 2], 16)
            .map_err(|e| Error::Config(format!("bad hex at offset {i}: {e}")))?;
        bytes.push(byte);
    }

    let mut decoder = FrameDecoder::new();
    decoder.push(&bytes);
    let mut found = false;
    loop {
        match decoder.next_frame() {
            Ok(Some(response)) => {
                found = true;
                println!("{response:?}");
            }
            Ok(None) => break,
            Err(err) => {
                found = true;
                println!("error: {err}");
            }
        }
    }
    if !found {
        println!("no complete frame in {} bytes", bytes.len());
    }
    if decoder.pending() > 0 {
        println!("{} trailing bytes not consumed", decoder.pending());
    }
    Ok(())
}
