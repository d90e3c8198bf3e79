//! Permission catalog installer.
//!
//! Reconciles the permissions declared by providers with the persisted
//! catalog: missing permissions are added together with their default role
//! grants (creating roles on demand), and optionally permissions no provider
//! declares any more are removed. Running it twice with the same providers
//! writes nothing the second time.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, keys};
use crate::config::AuthzConfig;
use crate::error::AuthzResult;
use crate::models::{NewRole, Role};
use crate::store::{AuthzStore, HookMode, StoreTransaction};

/// Roles that receive a set of permissions when those permissions are first
/// installed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DefaultGrant {
    /// Role system name. Created if it does not exist.
    pub role: String,
    pub permissions: Vec<String>,
}

/// A source of declared permissions, typically one per module or plugin.
pub trait PermissionProvider: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Every permission system name this provider declares.
    fn permissions(&self) -> anyhow::Result<Vec<String>>;

    /// Grants applied to newly installed permissions.
    fn default_grants(&self) -> anyhow::Result<Vec<DefaultGrant>> {
        Ok(Vec::new())
    }
}

/// Precondition protecting catalogs that still use the legacy naming: when
/// `legacy` is persisted but `marker` is not, the catalog has not been
/// migrated yet and installing would duplicate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationGuard {
    pub marker: String,
    pub legacy: String,
}

impl Default for MigrationGuard {
    fn default() -> Self {
        Self {
            marker: "catalog.self".to_string(),
            legacy: "ManageCatalog".to_string(),
        }
    }
}

impl MigrationGuard {
    fn blocks(&self, existing: &HashMap<String, i64>) -> bool {
        !existing.is_empty()
            && !existing.contains_key(&self.marker)
            && existing.contains_key(&self.legacy)
    }
}

/// Outcome of one installation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Permissions created, in creation order.
    pub added: Vec<String>,
    /// Number of permissions removed as unused.
    pub removed: u64,
    /// Roles created to receive default grants.
    pub roles_created: Vec<String>,
    /// Providers whose declarations could not be read.
    pub failed_providers: Vec<String>,
    /// The migration guard stopped the run before any change.
    pub skipped: bool,
}

impl InstallReport {
    /// Whether the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed == 0 && self.roles_created.is_empty()
    }
}

/// Installs and prunes the permission catalog.
#[derive(Clone)]
pub struct PermissionInstaller {
    store: Arc<dyn AuthzStore>,
    cache: Arc<dyn CacheStore>,
    guard: Option<MigrationGuard>,
    delete_chunk_size: usize,
}

impl PermissionInstaller {
    pub fn new(
        store: Arc<dyn AuthzStore>,
        cache: Arc<dyn CacheStore>,
        config: &AuthzConfig,
    ) -> Self {
        Self {
            store,
            cache,
            guard: Some(MigrationGuard::default()),
            delete_chunk_size: config.delete_chunk_size.max(1),
        }
    }

    /// Replace (or disable) the migration precondition.
    pub fn with_migration_guard(mut self, guard: Option<MigrationGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Install permissions declared by `providers`.
    ///
    /// A provider that fails to report its declarations is logged and
    /// skipped; persistence errors abort the run and roll everything back.
    /// Unused-permission removal is skipped when any provider failed, since
    /// its declarations are unknown.
    pub async fn install_permissions(
        &self,
        providers: &[Arc<dyn PermissionProvider>],
        remove_unused: bool,
    ) -> AuthzResult<InstallReport> {
        let mut report = InstallReport::default();
        let mut tx = self.store.begin(HookMode::ImportantOnly).await?;

        let mut existing: HashMap<String, i64> = tx
            .permissions()
            .await?
            .into_iter()
            .map(|p| (p.system_name, p.id))
            .collect();

        if let Some(guard) = self.guard.as_ref().filter(|g| g.blocks(&existing)) {
            warn!(
                marker = %guard.marker,
                legacy = %guard.legacy,
                "permission catalog has not been migrated, skipping installation"
            );
            report.skipped = true;
            return Ok(report);
        }

        let mut declared_by_all: HashSet<String> = HashSet::new();
        let mut roles: HashMap<String, Role> = HashMap::new();

        for provider in providers {
            let (declared, grants) = match read_provider(&**provider) {
                Ok(declared) => declared,
                Err(e) => {
                    warn!(
                        provider = %provider.name(),
                        error = %e,
                        "permission provider failed, skipping"
                    );
                    report.failed_providers.push(provider.name().to_string());
                    continue;
                }
            };

            for system_name in declared {
                declared_by_all.insert(system_name.clone());
                if existing.contains_key(&system_name) {
                    continue;
                }

                let permission = tx.insert_permission(&system_name).await?;
                existing.insert(system_name.clone(), permission.id);

                for grant in grants.iter().filter(|g| g.permissions.contains(&system_name)) {
                    let role =
                        resolve_role(tx.as_mut(), &mut roles, &grant.role, &mut report).await?;
                    tx.set_role_mapping(permission.id, role.id, Some(true))
                        .await?;
                }

                debug!(provider = %provider.name(), permission = %system_name, "permission added");
                report.added.push(system_name);
            }
        }

        if remove_unused {
            if report.failed_providers.is_empty() {
                let mut unused: Vec<i64> = existing
                    .iter()
                    .filter(|(name, _)| !declared_by_all.contains(*name))
                    .map(|(_, id)| *id)
                    .collect();
                unused.sort_unstable();

                for chunk in unused.chunks(self.delete_chunk_size) {
                    report.removed += tx.delete_permissions(chunk).await?;
                }
            } else {
                warn!(
                    failed = ?report.failed_providers,
                    "not removing unused permissions because some providers failed"
                );
            }
        }

        if tx.pending_changes() == 0 {
            debug!("permission catalog up to date");
            return Ok(report);
        }

        tx.commit().await?;

        if let Err(e) = self
            .cache
            .remove_by_pattern(keys::PERMISSION_TREE_PATTERN)
            .await
        {
            warn!(error = %e, "failed to evict permission trees after installation");
        }

        info!(
            added = report.added.len(),
            removed = report.removed,
            roles_created = report.roles_created.len(),
            failed_providers = report.failed_providers.len(),
            "permissions installed"
        );

        Ok(report)
    }
}

impl std::fmt::Debug for PermissionInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionInstaller")
            .field("guard", &self.guard)
            .field("delete_chunk_size", &self.delete_chunk_size)
            .finish()
    }
}

type ProviderDeclarations = (Vec<String>, Vec<DefaultGrant>);

/// Read a provider's declarations, de-duplicated in declaration order.
fn read_provider(provider: &dyn PermissionProvider) -> anyhow::Result<ProviderDeclarations> {
    let mut seen = HashSet::new();
    let declared = provider
        .permissions()?
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect();
    let grants = provider
        .default_grants()?
        .into_iter()
        .map(|grant| DefaultGrant {
            role: grant.role.trim().to_string(),
            permissions: grant
                .permissions
                .iter()
                .map(|name| name.trim().to_string())
                .collect(),
        })
        .filter(|grant| !grant.role.is_empty())
        .collect();
    Ok((declared, grants))
}

/// Find a role by system name within the transaction, creating it when it
/// does not exist yet.
async fn resolve_role(
    tx: &mut dyn StoreTransaction,
    roles: &mut HashMap<String, Role>,
    system_name: &str,
    report: &mut InstallReport,
) -> AuthzResult<Role> {
    let key = system_name.to_lowercase();
    if let Some(role) = roles.get(&key) {
        return Ok(role.clone());
    }

    let role = match tx.role_by_system_name(system_name).await? {
        Some(role) => role,
        None => {
            let role = tx.insert_role(NewRole::for_grant(system_name)).await?;
            info!(role = %system_name, "role created for default permission grants");
            report.roles_created.push(role.system_name.clone());
            role
        }
    };

    roles.insert(key, role.clone());
    Ok(role)
}

/// Catalog file format read by [`TomlPermissionProvider`].
#[derive(Debug, Deserialize)]
struct CatalogFile {
    name: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    grants: Vec<DefaultGrant>,
}

/// Provider reading a declared catalog from TOML:
///
/// ```toml
/// name = "storefront"
/// permissions = ["catalog", "catalog.product", "catalog.product.create"]
///
/// [[grants]]
/// role = "administrators"
/// permissions = ["catalog", "catalog.product", "catalog.product.create"]
/// ```
#[derive(Debug, Clone)]
pub struct TomlPermissionProvider {
    name: String,
    permissions: Vec<String>,
    grants: Vec<DefaultGrant>,
}

impl TomlPermissionProvider {
    /// Parse a catalog; `fallback_name` is used when the file has no `name`.
    pub fn parse(source: &str, fallback_name: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = toml::from_str(source).context("invalid permission catalog")?;

        Ok(Self {
            name: file.name.unwrap_or_else(|| fallback_name.to_string()),
            permissions: file.permissions,
            grants: file.grants,
        })
    }

    /// Load a catalog file, named after the file stem unless it sets `name`.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read permission catalog {}", path.display()))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("catalog");

        Self::parse(&source, stem)
    }
}

impl PermissionProvider for TomlPermissionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn permissions(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.permissions.clone())
    }

    fn default_grants(&self) -> anyhow::Result<Vec<DefaultGrant>> {
        Ok(self.grants.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_only_unmigrated_catalogs() {
        let guard = MigrationGuard::default();
        let catalog = |names: &[&str]| -> HashMap<String, i64> {
            names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), i as i64))
                .collect()
        };

        assert!(!guard.blocks(&catalog(&[])));
        assert!(guard.blocks(&catalog(&["ManageCatalog"])));
        assert!(!guard.blocks(&catalog(&["ManageCatalog", "catalog.self"])));
        assert!(!guard.blocks(&catalog(&["cms.page"])));
    }

    #[test]
    fn toml_catalog_parses() {
        let provider = TomlPermissionProvider::parse(
            r#"
            permissions = ["catalog", "catalog.product"]

            [[grants]]
            role = "administrators"
            permissions = ["catalog"]
            "#,
            "core",
        )
        .unwrap();

        assert_eq!(provider.name(), "core");
        assert_eq!(provider.permissions().unwrap().len(), 2);
        assert_eq!(provider.default_grants().unwrap()[0].role, "administrators");
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(TomlPermissionProvider::parse("permissions = [", "broken").is_err());
    }

    struct Duplicating;

    impl PermissionProvider for Duplicating {
        fn name(&self) -> &str {
            "duplicating"
        }

        fn permissions(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![
                "cms".to_string(),
                " cms ".to_string(),
                String::new(),
                "cms.page".to_string(),
            ])
        }
    }

    #[test]
    fn provider_declarations_are_trimmed_and_deduplicated() {
        let (declared, grants) = read_provider(&Duplicating).unwrap();
        assert_eq!(declared, vec!["cms".to_string(), "cms.page".to_string()]);
        assert!(grants.is_empty());
    }

    #[test]
    fn grant_names_are_trimmed() {
        let provider = TomlPermissionProvider::parse(
            r#"
            permissions = ["catalog"]

            [[grants]]
            role = " vendors "
            permissions = [" catalog "]

            [[grants]]
            role = "  "
            permissions = ["catalog"]
            "#,
            "padded",
        )
        .unwrap();

        let (_, grants) = read_provider(&provider).unwrap();
        assert_eq!(
            grants,
            vec![DefaultGrant {
                role: "vendors".to_string(),
                permissions: vec!["catalog".to_string()],
            }]
        );
    }
}
