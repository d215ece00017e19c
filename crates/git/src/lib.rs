use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use git2::{
    Direction, Error as Git2Error, FetchOptions, ObjectType, PushOptions, Repository, Signature,
    TreeWalkMode, TreeWalkResult, build::CheckoutBuilder,
};
use thiserror::Error;
use tracing::{debug, trace, warn};

mod auth;
mod validation;

pub use auth::GitAuth;
pub use validation::{is_safe_relative_path, is_valid_branch_name};

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Git(#[from] Git2Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid repository: {0}")]
    InvalidRepository(String),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("unsafe path rejected: {0}")]
    UnsafePath(String),
    #[error("push rejected as non-fast-forward")]
    NonFastForward,
    #[error("push rejected: {0}")]
    PushRejected(String),
}

impl GitError {
    /// Non-fast-forward pushes are retried with a rebase; everything else
    /// bubbles up.
    pub fn is_non_fast_forward(&self) -> bool {
        match self {
            GitError::NonFastForward => true,
            GitError::Git(e) => {
                e.code() == git2::ErrorCode::NotFastForward
                    || e.message().contains("non-fast-forward")
            }
            _ => false,
        }
    }
}

/// A file write or delete, relative to the repository root.
#[derive(Debug, Clone)]
pub struct FileMutation {
    pub path: String,
    /// `Some` writes the content, `None` deletes the file.
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedCounts {
    pub written: usize,
    pub deleted: usize,
}

impl AppliedCounts {
    pub fn total(&self) -> usize {
        self.written + self.deleted
    }
}

/// Commit author identity.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl CommitIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoMetadata {
    /// Local HEAD commit, when the branch has one.
    pub head: Option<String>,
    /// Whether the branch exists on the remote.
    pub remote_exists: bool,
    /// Commits on the remote branch not yet in the local branch.
    pub incoming: usize,
}

/// One branch of one remote repository, checked out in a directory owned
/// exclusively by a single branch worker. All methods are blocking; callers
/// run them under `spawn_blocking`.
pub struct BranchRepo {
    url: String,
    branch: String,
    local_path: PathBuf,
    auth: GitAuth,
}

const ORIGIN: &str = "origin";

impl BranchRepo {
    /// Open the local clone at `local_path`, initializing it (with `origin`
    /// pointing at `url`) on first use.
    pub fn open_or_init(
        url: &str,
        branch: &str,
        local_path: &Path,
        auth: GitAuth,
    ) -> Result<Self, GitError> {
        if !is_valid_branch_name(branch) {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        let repo = if local_path.join(".git").exists() {
            Repository::open(local_path)?
        } else {
            fs::create_dir_all(local_path)?;
            Repository::init_opts(
                local_path,
                git2::RepositoryInitOptions::new()
                    .initial_head(branch)
                    .mkdir(true),
            )?
        };
        match repo.find_remote(ORIGIN) {
            Ok(remote) if remote.url() == Some(url) => {}
            Ok(_) => repo.remote_set_url(ORIGIN, url)?,
            Err(_) => {
                repo.remote(ORIGIN, url)?;
            }
        }
        Ok(Self {
            url: url.to_string(),
            branch: branch.to_string(),
            local_path: local_path.to_path_buf(),
            auth,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn repo(&self) -> Result<Repository, GitError> {
        Repository::open(&self.local_path).map_err(GitError::from)
    }

    /// Ask the remote whether our branch exists there.
    pub fn remote_branch_exists(&self) -> Result<bool, GitError> {
        let repo = self.repo()?;
        let mut remote = repo.find_remote(ORIGIN)?;
        let connection =
            remote.connect_auth(Direction::Fetch, Some(self.auth.callbacks()), None)?;
        let wanted = format!("refs/heads/{}", self.branch);
        let exists = connection.list()?.iter().any(|head| head.name() == wanted);
        Ok(exists)
    }

    /// Fetch the branch from the remote into its tracking ref. Returns false
    /// when the branch does not exist remotely (nothing fetched).
    pub fn fetch(&self) -> Result<bool, GitError> {
        if !self.remote_branch_exists()? {
            trace!(branch = %self.branch, url = %self.url, "remote branch absent, skipping fetch");
            return Ok(false);
        }
        let repo = self.repo()?;
        let mut remote = repo.find_remote(ORIGIN)?;
        let refspec = format!(
            "+refs/heads/{branch}:refs/remotes/{ORIGIN}/{branch}",
            branch = self.branch
        );
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(self.auth.callbacks());
        remote.fetch(&[refspec.as_str()], Some(&mut opts), None)?;
        Ok(true)
    }

    /// Make the working tree reflect the branch: from the remote tracking
    /// ref when one exists, from the local branch otherwise, or leave HEAD
    /// unborn on a fresh branch so the first commit creates it.
    pub fn checkout(&self) -> Result<(), GitError> {
        let repo = self.repo()?;
        let tracking = format!("refs/remotes/{ORIGIN}/{}", self.branch);
        let local_ref = format!("refs/heads/{}", self.branch);

        if let Ok(reference) = repo.find_reference(&tracking) {
            let commit = reference.peel_to_commit()?;
            repo.branch(&self.branch, &commit, true)?;
        }
        repo.set_head(&local_ref)?;
        if repo.find_reference(&local_ref).is_ok() {
            let mut co = CheckoutBuilder::new();
            co.force();
            repo.checkout_head(Some(&mut co))?;
        }
        Ok(())
    }

    /// Discard local state and move the branch to the remote head. Used
    /// before replaying a batch after a rejected push.
    pub fn hard_reset_to_remote(&self) -> Result<(), GitError> {
        let repo = self.repo()?;
        let tracking = format!("refs/remotes/{ORIGIN}/{}", self.branch);
        let reference = repo
            .find_reference(&tracking)
            .map_err(|_| GitError::BranchNotFound(tracking.clone()))?;
        let commit = reference.peel_to_commit()?;
        repo.branch(&self.branch, &commit, true)?;
        repo.set_head(&format!("refs/heads/{}", self.branch))?;
        let object = commit.as_object();
        repo.reset(object, git2::ResetType::Hard, None)?;
        Ok(())
    }

    /// Write and delete files in the working tree and stage the changes.
    /// Every path is validated against traversal before anything is touched.
    pub fn apply_mutations(&self, mutations: &[FileMutation]) -> Result<AppliedCounts, GitError> {
        for mutation in mutations {
            if !is_safe_relative_path(&mutation.path) {
                return Err(GitError::UnsafePath(mutation.path.clone()));
            }
        }
        let repo = self.repo()?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| GitError::InvalidRepository("bare repository".to_string()))?
            .to_path_buf();
        let mut index = repo.index()?;
        let mut counts = AppliedCounts::default();

        for mutation in mutations {
            let abs = workdir.join(&mutation.path);
            match &mutation.content {
                Some(content) => {
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    write_atomic(&abs, content)?;
                    index.add_path(Path::new(&mutation.path))?;
                    counts.written += 1;
                }
                None => {
                    match fs::remove_file(&abs) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    if index.get_path(Path::new(&mutation.path), 0).is_some() {
                        index.remove_path(Path::new(&mutation.path))?;
                    }
                    counts.deleted += 1;
                }
            }
        }
        index.write()?;
        Ok(counts)
    }

    /// Commit the staged index. Returns `None` when the tree is unchanged
    /// from HEAD (nothing to commit).
    pub fn commit(
        &self,
        message: &str,
        identity: &CommitIdentity,
    ) -> Result<Option<String>, GitError> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let head_commit = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if let Some(parent) = &head_commit
            && parent.tree_id() == tree_id
        {
            debug!(branch = %self.branch, "nothing to commit");
            return Ok(None);
        }
        let tree = repo.find_tree(tree_id)?;
        let signature = Signature::now(&identity.name, &identity.email)?;
        let parents: Vec<&git2::Commit> = head_commit.iter().collect();
        let oid = repo.commit(
            Some(&format!("refs/heads/{}", self.branch)),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        // keep HEAD attached for unborn-branch first commits
        repo.set_head(&format!("refs/heads/{}", self.branch))?;
        Ok(Some(oid.to_string()))
    }

    /// Push the branch. Non-fast-forward rejections surface as
    /// [`GitError::NonFastForward`] so callers can rebase and retry.
    pub fn push(&self) -> Result<(), GitError> {
        let repo = self.repo()?;
        let mut remote = repo.find_remote(ORIGIN)?;
        let refspec = format!(
            "refs/heads/{branch}:refs/heads/{branch}",
            branch = self.branch
        );
        let rejection: std::sync::Mutex<Option<String>> = std::sync::Mutex::new(None);
        let mut callbacks = self.auth.callbacks();
        callbacks.push_update_reference(|_refname, status| {
            if let Some(message) = status {
                *rejection.lock().unwrap() = Some(message.to_string());
            }
            Ok(())
        });
        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        let pushed = remote.push(&[refspec.as_str()], Some(&mut opts));

        if let Some(message) = rejection.lock().unwrap().take() {
            if message.contains("non-fast-forward") || message.contains("fetch first") {
                return Err(GitError::NonFastForward);
            }
            return Err(GitError::PushRejected(message));
        }
        pushed.map_err(|e| {
            if e.code() == git2::ErrorCode::NotFastForward {
                GitError::NonFastForward
            } else {
                GitError::Git(e)
            }
        })?;
        // track what we just pushed
        if let Ok(reference) = repo.find_reference(&format!("refs/heads/{}", self.branch))
            && let Some(oid) = reference.target()
        {
            repo.reference(
                &format!("refs/remotes/{ORIGIN}/{}", self.branch),
                oid,
                true,
                "update tracking ref after push",
            )?;
        }
        Ok(())
    }

    pub fn head_sha(&self) -> Result<Option<String>, GitError> {
        let repo = self.repo()?;
        match repo.head() {
            Ok(head) => Ok(head.target().map(|oid| oid.to_string())),
            Err(_) => Ok(None),
        }
    }

    /// All blob paths under `prefix` in the committed tree, relative to the
    /// repository root. An unborn branch yields an empty list.
    pub fn list_files_under(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(_) => return Ok(Vec::new()),
        };
        let tree = head.peel_to_tree()?;
        let normalized = prefix.trim_matches('/');
        let mut files = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob)
                && let Some(name) = entry.name()
            {
                let path = if dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{dir}{name}")
                };
                if normalized.is_empty()
                    || path.strip_prefix(normalized).is_some_and(|rest| rest.starts_with('/'))
                {
                    files.push(path);
                }
            }
            TreeWalkResult::Ok
        })?;
        Ok(files)
    }

    /// Content of one blob at HEAD, or `None` when absent.
    pub fn read_file(&self, path: &str) -> Result<Option<String>, GitError> {
        let repo = self.repo()?;
        let tree = match repo.head() {
            Ok(head) => head.peel_to_tree()?,
            Err(_) => return Ok(None),
        };
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(_) => return Ok(None),
        };
        let blob = repo.find_blob(entry.id())?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }

    /// HEAD sha, remote existence, and incoming-commit count. Performs a
    /// fetch; callers cache the result.
    pub fn sync_and_get_metadata(&self) -> Result<RepoMetadata, GitError> {
        let remote_exists = self.fetch()?;
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head.target(),
            Err(_) => None,
        };
        let incoming = if remote_exists {
            let tracking = format!("refs/remotes/{ORIGIN}/{}", self.branch);
            match (head, repo.find_reference(&tracking).ok().and_then(|r| r.target())) {
                (Some(local), Some(remote)) => repo.graph_ahead_behind(local, remote)?.1,
                (None, Some(_)) => 1,
                _ => 0,
            }
        } else {
            0
        };
        Ok(RepoMetadata {
            head: head.map(|oid| oid.to_string()),
            remote_exists,
            incoming,
        })
    }

    /// Paths in the local branch tree that are in `prefix` but not in
    /// `keep`. Used by the orphan sweep.
    pub fn orphans_under(
        &self,
        prefix: &str,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, GitError> {
        Ok(self
            .list_files_under(prefix)?
            .into_iter()
            .filter(|path| !keep.contains(path) && !path.ends_with(KEEP_FILE))
            .collect())
    }
}

/// Placeholder file committed when bootstrapping an empty branch.
pub const KEEP_FILE: &str = ".gitmirror-keep";

fn write_atomic(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("yaml.tmp~");
    fs::write(&tmp, content)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            warn!(path = %path.display(), "atomic rename failed: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_counts_total() {
        let counts = AppliedCounts {
            written: 3,
            deleted: 2,
        };
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn non_fast_forward_detection() {
        assert!(GitError::NonFastForward.is_non_fast_forward());
        assert!(!GitError::BranchNotFound("main".into()).is_non_fast_forward());
    }
}
