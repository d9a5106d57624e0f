use crate::config::AppConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Config as PgConfig, NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(PgConnectionManager::from_config(config)?)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

/// Pool that opens connections on first checkout only.
pub fn lazy_pool(config: &AppConfig) -> Result<PgPool> {
    Ok(Pool::builder()
        .max_size(config.max_pool_size)
        .build_unchecked(PgConnectionManager::from_config(config)?))
}

/// Opens `AsyncPgConnection`s, over TLS when a root certificate is configured.
#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PgConnectionManager {
    fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            config: config
                .database_url
                .parse()
                .context("invalid NINJA_DATABASE_URL")?,
            tls: tls_connector(config)?,
        })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match &self.tls {
            Some(tls) => open(&self.config, tls.clone()).await,
            None => open(&self.config, NoTls).await,
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

async fn open<T>(config: &PgConfig, tls: T) -> Result<AsyncPgConnection>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = config.connect(tls).await?;
    Ok(AsyncPgConnection::try_from_client_and_connection(client, connection).await?)
}

/// Rustls connector from the `NINJA_PG_SSL_*` files, `None` without a root certificate.
fn tls_connector(config: &AppConfig) -> Result<Option<MakeRustlsConnect>> {
    let Some(root) = config.pg_ssl_root_cert.as_deref() else {
        return Ok(None);
    };

    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(read_certs(root)?);
    anyhow::ensure!(added > 0, "no usable root certificate in {root}");

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let tls = match (config.pg_ssl_cert.as_deref(), config.pg_ssl_key.as_deref()) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .context("client certificate does not match its key")?,
        _ => anyhow::bail!("NINJA_PG_SSL_CERT and NINJA_PG_SSL_KEY must be set together"),
    };
    Ok(Some(MakeRustlsConnect::new(tls)))
}

fn pem(path: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("failed to open {path}"))
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem(path)?)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to parse certificates in {path}"))?;
    anyhow::ensure!(!certs.is_empty(), "{path} contains no certificates");
    Ok(certs)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem(path)?)
        .with_context(|| format!("failed to parse private key in {path}"))?
        .with_context(|| format!("{path} contains no private key"))
}
