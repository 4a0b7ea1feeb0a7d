//! TCP front end of the broker

use std::net::SocketAddr;
use std::sync::Arc;

use recarga_core::Region;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BrokerError;
use crate::history::HistoryStore;

/// Broker before binding
pub struct Broker {
    config: BrokerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Broker {
    pub fn new(config: BrokerConfig, region: Region, history: Arc<dyn HistoryStore>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), Arc::new(region), history));
        Self { config, dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the listener; failure here is fatal for the process
    pub async fn bind(self) -> Result<BoundBroker, BrokerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Broker: listening on {}", local_addr);

        Ok(BoundBroker {
            listener,
            local_addr,
            dispatcher: self.dispatcher,
        })
    }
}

/// Broker with a bound listener
pub struct BoundBroker {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
}

impl BoundBroker {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Broker: set_nodelay failed for {}: {}", addr, e);
                    }
                    tokio::spawn(self.dispatcher.clone().serve_connection(stream, addr));
                }
                Err(e) => {
                    error!("Broker: accept failed: {}", e);
                }
            }
        }
    }
}
