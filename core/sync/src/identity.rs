//! Account identity discovery.

use regex::Regex;
use std::sync::OnceLock;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use xregion_common::{Error, Result};
use xregion_provider::{CloudClient, IdentityDirectory};

fn principal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^arn:aws:iam::(\d+):").expect("static pattern is valid"))
}

/// Extract the account number embedded in a principal reference.
pub fn account_from_principal(reference: &str) -> Option<String> {
    principal_pattern()
        .captures(reference)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Resolves the account identifier used to build resource references.
///
/// A configured override always wins. Otherwise the provider is asked once
/// per resolver; the answer, including "not found", is cached for the
/// resolver's lifetime.
#[derive(Debug)]
pub struct AccountResolver {
    job: String,
    override_id: Option<String>,
    cache: OnceCell<Option<String>>,
}

impl AccountResolver {
    /// Create a resolver for the named job.
    pub fn new(job: impl Into<String>, override_id: Option<String>) -> Self {
        Self {
            job: job.into(),
            override_id: override_id.filter(|id| !id.is_empty()),
            cache: OnceCell::new(),
        }
    }

    /// Resolve the account identifier.
    ///
    /// # Errors
    /// - `Configuration` if nothing was found and `required` is set
    /// - Provider errors from the lookup (not cached, the next call retries)
    pub async fn resolve(&self, client: &dyn CloudClient, required: bool) -> Result<Option<String>> {
        let resolved = self
            .cache
            .get_or_try_init(|| async {
                if let Some(id) = &self.override_id {
                    return Ok(Some(id.clone()));
                }
                self.lookup(client).await
            })
            .await?;

        match resolved {
            Some(id) => Ok(Some(id.clone())),
            None if required => Err(Error::configuration(
                &self.job,
                "an 'account_id' client option must be provided for building resource \
                 references, the account id could not be retrieved automatically",
            )),
            None => Ok(None),
        }
    }

    async fn lookup(&self, client: &dyn CloudClient) -> Result<Option<String>> {
        let references = client.principal_references(1).await?;
        let account = references
            .first()
            .and_then(|reference| account_from_principal(reference));

        match &account {
            Some(id) => debug!("{}: discovered account id {}", self.job, id),
            None => warn!("{}: unable to discover account id", self.job),
        }
        Ok(account)
    }
}
