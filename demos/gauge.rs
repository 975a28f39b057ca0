//! This example follows the gauge peripheral and prints every status update and reading.
//!
//! Pass a device address in format XX:XX:XX:XX:XX:XX to follow another peripheral.

use blegauge::common::characteristics::RPM;
use blegauge::{
    Error, Monitor, MonitorConfig, RadioCapability, SharedCapability, TargetDescriptor,
    UpdateBroadcast,
};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let target = match std::env::args().nth(1) {
        Some(address) => TargetDescriptor::parse(&address)?,
        None => TargetDescriptor::gauge()?,
    }
    .with_characteristic(RPM);

    log::info!("Following device {}", target.address());

    // Permissions are granted up front in this example
    let capability = SharedCapability::new(RadioCapability::Available);
    let updates = UpdateBroadcast::default();

    let mut monitor = Monitor::new(target, capability, updates.clone());
    monitor.start(MonitorConfig::default()).await?;

    let mut update_stream = updates.stream();
    let mut state = monitor.state();

    monitor.start_scan().await?;

    loop {
        tokio::select! {
            update = update_stream.next() => match update {
                Some(update) => println!("{}", update),
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.close().await?;
    updates.close_streams();

    Ok(())
}
