//! `GitHubClient` backed by `octocrab`.

use async_trait::async_trait;
use coordination::{GitError, GitHubClient, GitResult, PrMergeStrategy, PullRequestSpec};
use octocrab::params::pulls::MergeMethod;
use octocrab::Octocrab;

pub struct OctocrabGitHubClient {
    client: Octocrab,
    owner: String,
    repo: String,
}

impl OctocrabGitHubClient {
    pub fn new(token: Option<String>, owner: String, repo: String) -> GitResult<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token);
        }
        let client = builder.build().map_err(|e| GitError::Failed(format!("building github client: {e}")))?;
        Ok(Self { client, owner, repo })
    }
}

#[async_trait]
impl GitHubClient for OctocrabGitHubClient {
    async fn create_pr(&self, spec: PullRequestSpec) -> GitResult<u64> {
        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .create(&spec.title, &spec.head_branch, &spec.base_branch)
            .body(&spec.body)
            .send()
            .await
            .map_err(|e| GitError::Failed(format!("creating PR: {e}")))?;
        Ok(pr.number)
    }

    async fn merge_pr(&self, number: u64, strategy: PrMergeStrategy) -> GitResult<()> {
        let method = match strategy {
            PrMergeStrategy::Merge => MergeMethod::Merge,
            PrMergeStrategy::Squash => MergeMethod::Squash,
            PrMergeStrategy::Rebase => MergeMethod::Rebase,
        };
        self.client
            .pulls(&self.owner, &self.repo)
            .merge(number)
            .method(method)
            .send()
            .await
            .map_err(|e| GitError::Failed(format!("merging PR #{number}: {e}")))?;
        Ok(())
    }
}
