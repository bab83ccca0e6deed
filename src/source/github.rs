use std::path::Path;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use super::{CommitRef, SourceHost};
use crate::{Error, Result};

/// Root of the public GitHub REST API.
pub const GITHUB_API_ROOT: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

/// [`SourceHost`] talking to GitHub.
///
/// The token and the API media type are only sent to URLs under the API root. Direct `source` downloads may point
/// at any host and go out bare.
#[derive(Clone, Debug)]
pub struct GitHub {
    client: Client,
    api_root: String,
    token: Option<String>,
}

impl GitHub {
    /// Creates a client, authenticating API calls with `token` when given.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be constructed.
    pub fn new(token: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("mjsuite/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_root: GITHUB_API_ROOT.to_string(),
            token: token.map(str::to_string),
        })
    }

    /// Points the client at another API root, such as a GitHub Enterprise instance.
    #[must_use]
    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into().trim_end_matches('/').to_string();
        self
    }

    fn is_api_url(&self, url: &str) -> bool {
        url.strip_prefix(&self.api_root)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        if !self.is_api_url(url) {
            return request;
        }
        let request = request.header(header::ACCEPT, "application/vnd.github+json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_ref(&self, repository: &str, reference: &str) -> Result<Option<GitObject>> {
        let url = format!("{}/repos/{repository}/git/ref/{reference}", self.api_root);
        log::debug!("looking up {url}...");
        let response = self.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let git_ref: GitRef = response.error_for_status()?.json().await?;
        Ok(Some(git_ref.object))
    }

    async fn peel_tag(&self, repository: &str, tag_sha: &str) -> Result<GitObject> {
        let url = format!("{}/repos/{repository}/git/tags/{tag_sha}", self.api_root);
        log::debug!("dereferencing annotated tag {url}...");
        let tag: GitRef = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(tag.object)
    }
}

#[async_trait]
impl SourceHost for GitHub {
    async fn resolve_commit(&self, repository: &str, version: &str) -> Result<CommitRef> {
        let resolution_error = |reason: String| Error::Resolution {
            repository: repository.to_string(),
            version: version.to_string(),
            reason,
        };

        for namespace in ["tags", "heads"] {
            let object = self
                .get_ref(repository, &format!("{namespace}/{version}"))
                .await
                .map_err(|err| resolution_error(err.to_string()))?;
            let Some(mut object) = object else {
                continue;
            };

            // annotated tags point at a tag object, possibly nested
            while object.kind == "tag" {
                object = self
                    .peel_tag(repository, &object.sha)
                    .await
                    .map_err(|err| resolution_error(err.to_string()))?;
            }
            log::debug!("resolved {repository}@{version} via {namespace} to {}", object.sha);
            return Ok(CommitRef::new(object.sha));
        }

        Err(resolution_error(
            "no tag or branch with this name, pin a commit with `sha` in the engine manifest instead"
                .to_string(),
        ))
    }

    fn archive_url(&self, repository: &str, commit: &CommitRef) -> String {
        format!("{}/repos/{repository}/tarball/{commit}", self.api_root)
    }

    fn clone_url(&self, repository: &str) -> String {
        format!("https://github.com/{repository}.git")
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<()> {
        log::debug!("downloading {url} to {}...", destination.display());
        let fetch_error = |err: reqwest::Error| Error::Fetch(format!("{url}: {err}"));
        let data = self
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_error)?
            .bytes()
            .await
            .map_err(fetch_error)?;
        tokio::fs::write(destination, &data).await?;
        log::debug!("downloaded {} bytes", data.len());
        Ok(())
    }
}
