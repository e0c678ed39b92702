use crate::args::PostgresArgs;
use anyhow::{Context, Result, bail};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod};
use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};
use tokio_postgres::NoTls;
use tokio_postgres_rustls::MakeRustlsConnect;

pub async fn create_pool(pg_args: PostgresArgs) -> Result<Pool> {
    let mut tls_connector = None;
    if let Some(ref ca_cert) = pg_args.postgres_ca_cert {
        let extra_roots =
            parse_ca_certs(ca_cert.as_bytes()).context("failed to parse Postgres CA certificate")?;
        tls_connector = Some(make_rustls(extra_roots)?);
    }
    let mut pg_pool_cfg = PgConfig::new();
    pg_pool_cfg.dbname = Some(pg_args.postgres_database);
    pg_pool_cfg.host = Some(pg_args.postgres_host);
    pg_pool_cfg.port = Some(pg_args.postgres_port);
    pg_pool_cfg.user = Some(pg_args.postgres_username);
    pg_pool_cfg.password = pg_args.postgres_password;
    pg_pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    let pool = if let Some(tls) = tls_connector {
        pg_pool_cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
    } else {
        pg_pool_cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
    }
    .context("failed to create Postgres pool")?;
    Ok(pool)
}

fn make_rustls(certs: Vec<CertificateDer<'static>>) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .certs
        .into_iter()
    {
        let _ = roots.add(cert);
    }
    for cert in certs {
        roots.add(cert).context("failed to add CA certificate")?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

fn parse_ca_certs(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    // If it's PEM, decode all the certs; otherwise treat as raw DER
    if bytes.starts_with(b"-----BEGIN") {
        let mut rd: &[u8] = bytes;
        let mut out = Vec::new();
        for item in rustls_pemfile::read_all(&mut rd) {
            let item = item.map_err(|e| anyhow::anyhow!("failed to parse PEM bundle: {}", e))?;
            if let rustls_pemfile::Item::X509Certificate(der) = item {
                out.push(der);
            }
        }
        if out.is_empty() {
            bail!("no X509 certificates found in provided PEM");
        }
        Ok(out)
    } else {
        Ok(vec![CertificateDer::from(bytes.to_vec())])
    }
}
