use smol_macros::{main, Executor};

use anyhow::Context;
use async_channel::Receiver;
use log::info;
use sonar_sens::config::Config;
use sonar_sens::sens::{ChannelListener, Communicator, Listener, SerialTransport, StampedReading};
use std::sync::Arc;

main! {
    async fn main(ex: &Executor<'_>) -> anyhow::Result<()> {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

        let config = match std::env::args().nth(1) {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        info!("Reading {} at {} baud", config.port, config.baud_rate);

        // Set a handler that sends a message through a channel.
        let (ctrl_c_sender, mut ctrl_c_receiver) = async_broadcast::broadcast(10);
        let handle = move || {
            ctrl_c_sender.try_broadcast(()).ok();
        };
        ctrlc::set_handler(handle).context("installing Ctrl+C handler")?;

        let (sender, receiver) = async_channel::bounded(config.channel_capacity);
        let listener: Arc<dyn Listener> = Arc::new(ChannelListener::new(sender));
        let communicator = Communicator::new(SerialTransport::new(), config.communicator(), Some(listener));
        communicator.start()?;

        let printer = ex.spawn(print_readings(receiver));
        ctrl_c_receiver.recv().await.ok();
        info!("Ctrl+C received");

        // Joining the worker blocks, keep it off the executor.
        smol::unblock(move || communicator.finish()).await;
        printer.await;
        Ok(())
    }
}

async fn print_readings(receiver: Receiver<StampedReading>) {
    while let Ok(StampedReading { timestamp, reading }) = receiver.recv().await {
        println!("[{timestamp:?}] {reading}");
    }
    info!("Reading channel closed, exit");
}
