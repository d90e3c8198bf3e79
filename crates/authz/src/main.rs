//! Bazaar authorization CLI
//!
//! Installs declared permission catalogs and inspects role permissions
//! against the platform database.
//!
//! Usage:
//!   bazaar-authz install --catalog permissions.toml --remove-unused
//!   bazaar-authz tree --role administrators
//!   bazaar-authz check --role registered catalog.product.read --descendants

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bazaar_authz::cache::{CacheStore, MokaCacheStore};
use bazaar_authz::context::StaticWorkContext;
use bazaar_authz::models::{Allow, Customer, Role};
use bazaar_authz::permissions::{PermissionProvider, PermissionTree, TomlPermissionProvider};
use bazaar_authz::store::{AuthzStore, PgStore};
use bazaar_authz::{AclService, AuthzConfig, PermissionInstaller, PermissionService, invalidation};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install permissions declared in one or more catalog files.
    Install {
        /// Catalog file (TOML). May be given several times.
        #[arg(long = "catalog", required = true)]
        catalogs: Vec<PathBuf>,

        /// Remove persisted permissions no catalog declares.
        #[arg(long)]
        remove_unused: bool,
    },

    /// Print a role's permission tree.
    Tree {
        /// Role system name.
        #[arg(long)]
        role: String,
    },

    /// Check one permission for a role.
    Check {
        /// Role system name.
        #[arg(long)]
        role: String,

        /// Permission system name.
        permission: String,

        /// Also grant when any descendant permission is granted.
        #[arg(long)]
        descendants: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let args = Args::parse();
    let config = AuthzConfig::from_env().context("failed to load configuration")?;

    let pool = create_pool(&config).await?;
    let store: Arc<dyn AuthzStore> = Arc::new(PgStore::new(pool));
    let cache: Arc<dyn CacheStore> = Arc::new(MokaCacheStore::new(config.cache_max_capacity));
    let context = Arc::new(StaticWorkContext::default());

    let acl = AclService::new(store.clone(), cache.clone(), context.clone());
    invalidation::register(store.as_ref(), cache.clone(), &acl);

    match args.command {
        Command::Install {
            catalogs,
            remove_unused,
        } => {
            let mut providers: Vec<Arc<dyn PermissionProvider>> = Vec::new();
            for path in &catalogs {
                providers.push(Arc::new(TomlPermissionProvider::from_path(path)?));
            }

            let installer = PermissionInstaller::new(store, cache, &config);
            let report = installer
                .install_permissions(&providers, remove_unused)
                .await
                .context("permission installation failed")?;

            if report.skipped {
                println!("Installation skipped: permission catalog needs migration first");
            } else {
                println!(
                    "Added {} permission(s), removed {}, created {} role(s)",
                    report.added.len(),
                    report.removed,
                    report.roles_created.len()
                );
                for name in &report.failed_providers {
                    println!("  provider failed: {name}");
                }
            }
        }
        Command::Tree { role } => {
            let role = find_role(store.as_ref(), &role).await?;
            let permissions = PermissionService::new(store, cache, context, config);
            let tree = permissions.get_permission_tree(role.id).await?;
            print_tree(&tree);
        }
        Command::Check {
            role,
            permission,
            descendants,
        } => {
            let role = find_role(store.as_ref(), &role).await?;
            let customer = Customer::new(0, vec![role]);
            let permissions = PermissionService::new(store, cache, context, config);

            let granted = if descendants {
                permissions
                    .find_authorization_customer(&permission, &customer)
                    .await?
            } else {
                permissions.authorize_customer(&permission, &customer).await?
            };

            println!("{permission}: {}", if granted { "granted" } else { "denied" });
        }
    }

    Ok(())
}

/// Create a PostgreSQL connection pool.
async fn create_pool(config: &AuthzConfig) -> Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;

    info!("database connection established");
    Ok(pool)
}

async fn find_role(store: &dyn AuthzStore, system_name: &str) -> Result<Role> {
    store
        .role_by_system_name(system_name)
        .await?
        .with_context(|| format!("role '{system_name}' not found"))
}

fn print_tree(tree: &PermissionTree) {
    for node in tree.iter() {
        let marker = match node.allow {
            Allow::Grant => "+",
            Allow::Deny => "-",
            Allow::Inherit => " ",
        };
        let effective = if tree.authorize(&node.system_name) {
            "allowed"
        } else {
            "denied"
        };
        println!(
            "{marker} {:indent$}{} ({effective})",
            "",
            node.system_name,
            indent = tree.depth(node) * 2
        );
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
