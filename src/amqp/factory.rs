use crate::amqp::configuration::{RabbitMqSettings, RabbitMqTlsSettings};
use crate::pool::ConnectionPool;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to a RabbitMq broker, in plain text or over TLS.
///
/// It is the [`deadpool`] manager behind [`ConnectionPool`]: see [`ConnectionFactory::into_pool`].
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    /// Shown in the RabbitMq management UI, if set.
    connection_name: Option<String>,
    /// `None` for unencrypted connections.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    /// The domain expected on the server certificate.
    domain: String,
}

impl Tls {
    fn from_settings(settings: &RabbitMqTlsSettings, host: &str) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = settings.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        Ok(Self {
            connector: builder
                .build()
                .context("Failed to build the TLS connector for RabbitMq")?,
            domain: settings.domain.clone().unwrap_or_else(|| host.to_owned()),
        })
    }
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// The connection timeout defaults to 10 seconds if `settings` leave it unspecified.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let uri = settings.amqp_uri();
        let tls = match &settings.tls {
            Some(tls) => Some(Arc::new(Tls::from_settings(tls, &uri.authority.host)?)),
            None => None,
        };
        Ok(Self {
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            connection_name: settings.connection_name.clone(),
            tls,
            uri,
        })
    }

    /// Encrypt connections with `connector`, expecting `domain` on the server certificate
    /// (the broker host if `None`).
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector, domain: Option<String>) {
        let domain = domain.unwrap_or_else(|| self.uri.authority.host.clone());
        self.tls = Some(Arc::new(Tls { connector, domain }));
    }

    /// Open a new connection to the broker, giving up after the configured timeout.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<Connection, anyhow::Error> {
        let mut properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connect = async {
            match &self.tls {
                None => Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        let connection = tokio::time::timeout(self.connection_timeout, connect)
            .await
            .context("Timed out while connecting to RabbitMq")??;

        connection.on_error(|e| {
            warn!(error = ?e, "RabbitMq connection broken");
        });
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<Connection, lapin::Error> {
        Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP over the AMQP scheme first, then the TLS handshake with our own
                // connector and expected domain.
                let mut plain = uri.clone();
                plain.scheme = AMQPScheme::AMQP;
                plain
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
            }),
            properties,
        )
        .await
    }

    /// Turn the factory into a [`ConnectionPool`] holding at most `max_connections` connections.
    pub fn into_pool(self, max_connections: usize) -> Result<ConnectionPool, anyhow::Error> {
        ConnectionPool::builder(self)
            .max_size(max_connections)
            .build()
            .context("Failed to build the RabbitMq connection pool")
    }
}
