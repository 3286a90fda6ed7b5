#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate diesel_derive_enum;

mod config;
mod csr;
mod errors;
mod goodkey;
mod iana;
mod identifier;
mod models;
mod policy;
mod ra;
mod ratelimit;
mod sa;
mod schema;
mod sct;

pub mod cert_ra {
    tonic::include_proto!("cert_ra");
}

type DBPool = diesel_async::pooled_connection::mobc::Pool<diesel_async::AsyncPgConnection>;
type DBConn = mobc::Connection<diesel_async::pooled_connection::AsyncDieselConnectionManager<diesel_async::AsyncPgConnection>>;

pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations");

fn main() {
    use diesel_migrations::MigrationHarness;
    use diesel::Connection;

    pretty_env_logger::init();

    info!("Loading config");
    let env = ::config::Environment::with_prefix("ACME_RA")
        .prefix_separator("_")
        .separator("_")
        .keep_prefix(false);
    let file = ::config::File::new("config.toml", ::config::FileFormat::Toml)
        .required(false);
    let conf = match ::config::Config::builder()
        .add_source(env)
        .add_source(file)
        .build() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to get config: {}", e);
            std::process::exit(1);
        }
    };

    let conf: config::Config = match conf.try_deserialize() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to parse config: {}", e);
            std::process::exit(1);
        }
    };

    if !conf.validation_profiles.contains_key(&conf.default_profile_name) {
        error!("Default profile {:?} is not a configured profile", conf.default_profile_name);
        std::process::exit(1);
    }

    info!("Loading identifier policy");
    let pa = policy::Authority::new(
        conf.enabled_identifiers.iter().copied().collect(),
        conf.enabled_challenges.iter().copied().collect(),
    );
    if let Err(e) = pa.load_ident_policy_file(&conf.policy_path) {
        error!("Failed to load identifier policy: {}", e);
        std::process::exit(1);
    }

    info!("Loading rate limits");
    let registry = match ratelimit::limit::Registry::from_files(
        &conf.limits.defaults_path,
        conf.limits.overrides_path.as_deref(),
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to load rate limits: {}", e);
            std::process::exit(1);
        }
    };
    let limiter = ratelimit::limiter::Limiter::new(
        registry,
        std::sync::Arc::new(ratelimit::source::MemorySource::new()),
    );

    let va_endpoint = match tonic::transport::Endpoint::try_from(conf.va_url.clone()) {
        Ok(v) => v,
        Err(e) => {
            error!("Invalid VA URL: {}", e);
            std::process::exit(1);
        }
    };
    let ca_endpoint = match tonic::transport::Endpoint::try_from(conf.ca_url.clone()) {
        Ok(v) => v,
        Err(e) => {
            error!("Invalid CA URL: {}", e);
            std::process::exit(1);
        }
    };

    info!("Setting up runtime");
    let rt = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to setup Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    info!("Running migrations");
    let mut conn = match diesel::pg::PgConnection::establish(&conf.database_url) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to get database connection: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = conn.run_pending_migrations(MIGRATIONS) {
        error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    let db_config = diesel_async::pooled_connection::AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(conf.database_url.clone());
    let db_pool = DBPool::new(db_config);

    info!("Starting server");
    let http_client = reqwest::Client::new();

    let ra = ra::RA {
        sa: sa::Storage::new(db_pool),
        pa: pa.into(),
        limiter: limiter.into(),
        va: mobc::Pool::new(ra::ValidatorManager {
            endpoint: va_endpoint
                .concurrency_limit(8)
                .user_agent("ACME RA").unwrap()
                .tcp_keepalive(Some(std::time::Duration::from_secs(5)))
                .connect_timeout(std::time::Duration::from_secs(5)),
        }),
        ca: mobc::Pool::new(ra::SignerManager {
            endpoint: ca_endpoint
                .concurrency_limit(8)
                .user_agent("ACME RA").unwrap()
                .tcp_keepalive(Some(std::time::Duration::from_secs(5)))
                .connect_timeout(std::time::Duration::from_secs(5)),
        }),
        http_client: http_client.into(),
        config: std::sync::Arc::new(conf.clone()),
    };

    let server_future = async {
        // Overrides stored in the database win over the YAML migration file.
        match ra.sa.get_enabled_rate_limit_overrides().await {
            Ok(overrides) => {
                for row in overrides {
                    match row.to_limit() {
                        Ok(limit) => {
                            if let Err(e) = ra.limiter.set_override(row.bucket_key.clone(), limit) {
                                warn!("Failed to install override {}: {}", row.bucket_key, e);
                            }
                        }
                        Err(e) => warn!("Skipping invalid override {}: {}", row.bucket_key, e),
                    }
                }
            }
            Err(e) => warn!("Failed to load rate limit overrides from storage: {}", e),
        }

        tonic::transport::Server::builder()
            .add_service(cert_ra::registration_authority_server::RegistrationAuthorityServer::new(ra.clone()))
            .add_service(cert_ra::sct_provider_server::SctProviderServer::new(ra))
            .serve(conf.listen)
            .await
    };

    info!("Listening for requests on {}", conf.listen);
    rt.block_on(server_future).expect("failed to run the future on runtime");
}
