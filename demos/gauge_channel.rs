//! This example hands readings to a tokio channel and stops after ten samples.

use blegauge::{
    Error, Monitor, MonitorConfig, RadioCapability, SharedCapability, TargetDescriptor, Update,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let (sender, mut receiver) = mpsc::unbounded_channel();

    let capability = SharedCapability::new(RadioCapability::Available);
    let mut monitor = Monitor::new(TargetDescriptor::gauge()?, capability, sender);
    monitor.start(MonitorConfig::default()).await?;
    monitor.start_scan().await?;

    let mut samples = 0;
    while let Some(update) = receiver.recv().await {
        match update {
            Update::Sample(sample) => {
                println!("Received: {}", sample.value);
                samples += 1;
                if samples == 10 {
                    break;
                }
            }
            Update::Status(status) => println!("{}", status),
        }
    }

    monitor.close().await
}
