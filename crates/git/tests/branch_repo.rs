use std::collections::HashSet;
use std::path::{Path, PathBuf};

use git::{BranchRepo, CommitIdentity, FileMutation, GitAuth, GitError};
use tempfile::TempDir;

fn identity() -> CommitIdentity {
    CommitIdentity::new("gitmirror", "noreply@gitmirror.dev")
}

fn init_bare_remote(root: &TempDir) -> PathBuf {
    let path = root.path().join("remote.git");
    git2::Repository::init_bare(&path).unwrap();
    path
}

fn open_branch(root: &TempDir, remote: &Path, dir: &str, branch: &str) -> BranchRepo {
    BranchRepo::open_or_init(
        remote.to_str().unwrap(),
        branch,
        &root.path().join(dir),
        GitAuth::Anonymous,
    )
    .unwrap()
}

fn write(repo: &BranchRepo, path: &str, content: &str) {
    repo.apply_mutations(&[FileMutation {
        path: path.to_string(),
        content: Some(content.to_string()),
    }])
    .unwrap();
}

#[test]
fn first_commit_creates_branch_and_pushes() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let repo = open_branch(&td, &remote, "work", "main");

    assert!(!repo.remote_branch_exists().unwrap());
    repo.checkout().unwrap();
    write(&repo, "clusters/prod/v1/configmaps/prod/app.yaml", "data: {}\n");
    let sha = repo.commit("mirror: 1 created", &identity()).unwrap();
    assert!(sha.is_some());
    repo.push().unwrap();
    assert!(repo.remote_branch_exists().unwrap());

    let bare = git2::Repository::open_bare(&remote).unwrap();
    let head = bare
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    assert_eq!(head.author().name(), Some("gitmirror"));
    assert!(
        head.tree()
            .unwrap()
            .get_path(Path::new("clusters/prod/v1/configmaps/prod/app.yaml"))
            .is_ok()
    );
}

#[test]
fn commit_with_unchanged_tree_is_a_noop() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let repo = open_branch(&td, &remote, "work", "main");
    repo.checkout().unwrap();
    write(&repo, "a.yaml", "a: 1\n");
    repo.commit("first", &identity()).unwrap();
    write(&repo, "a.yaml", "a: 1\n");
    assert_eq!(repo.commit("again", &identity()).unwrap(), None);
}

#[test]
fn second_clone_sees_pushed_state() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let writer = open_branch(&td, &remote, "writer", "main");
    writer.checkout().unwrap();
    write(&writer, "clusters/x/v1/pods/ns/a.yaml", "kind: Pod\n");
    writer.commit("seed", &identity()).unwrap();
    writer.push().unwrap();

    let reader = open_branch(&td, &remote, "reader", "main");
    assert!(reader.fetch().unwrap());
    reader.checkout().unwrap();
    assert_eq!(
        reader.read_file("clusters/x/v1/pods/ns/a.yaml").unwrap(),
        Some("kind: Pod\n".to_string())
    );
}

#[test]
fn non_fast_forward_push_surfaces_and_replay_recovers() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);

    let a = open_branch(&td, &remote, "a", "main");
    a.checkout().unwrap();
    write(&a, "base.yaml", "v: 0\n");
    a.commit("base", &identity()).unwrap();
    a.push().unwrap();

    let b = open_branch(&td, &remote, "b", "main");
    b.fetch().unwrap();
    b.checkout().unwrap();

    // a advances the remote behind b's back
    write(&a, "from-a.yaml", "v: 1\n");
    a.commit("from a", &identity()).unwrap();
    a.push().unwrap();

    write(&b, "from-b.yaml", "v: 2\n");
    b.commit("from b", &identity()).unwrap();
    let err = b.push().unwrap_err();
    assert!(err.is_non_fast_forward(), "unexpected error: {err}");

    // replay: fetch, reset to remote, re-apply our mutation, push again
    b.fetch().unwrap();
    b.hard_reset_to_remote().unwrap();
    write(&b, "from-b.yaml", "v: 2\n");
    b.commit("from b", &identity()).unwrap();
    b.push().unwrap();

    let check = open_branch(&td, &remote, "check", "main");
    check.fetch().unwrap();
    check.checkout().unwrap();
    assert!(check.read_file("from-a.yaml").unwrap().is_some());
    assert!(check.read_file("from-b.yaml").unwrap().is_some());
}

#[test]
fn list_files_is_prefix_scoped() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let repo = open_branch(&td, &remote, "work", "main");
    repo.checkout().unwrap();
    write(&repo, "clusters/prod/v1/configmaps/ns/a.yaml", "a: 1\n");
    write(&repo, "clusters/prod/v1/configmaps/ns/b.yaml", "b: 1\n");
    write(&repo, "clusters/staging/v1/configmaps/ns/c.yaml", "c: 1\n");
    repo.commit("seed", &identity()).unwrap();

    let mut files = repo.list_files_under("clusters/prod").unwrap();
    files.sort();
    assert_eq!(
        files,
        vec![
            "clusters/prod/v1/configmaps/ns/a.yaml".to_string(),
            "clusters/prod/v1/configmaps/ns/b.yaml".to_string(),
        ]
    );
    // a prefix that is only a string prefix of another directory must not match
    assert!(repo.list_files_under("clusters/pro").unwrap().is_empty());
}

#[test]
fn orphan_listing_excludes_kept_ids_and_placeholder() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let repo = open_branch(&td, &remote, "work", "main");
    repo.checkout().unwrap();
    write(&repo, "clusters/prod/.gitmirror-keep", "");
    write(&repo, "clusters/prod/v1/configmaps/ns/keep.yaml", "k: 1\n");
    write(&repo, "clusters/prod/v1/configmaps/ns/orphan.yaml", "o: 1\n");
    repo.commit("seed", &identity()).unwrap();

    let keep: HashSet<String> =
        std::iter::once("clusters/prod/v1/configmaps/ns/keep.yaml".to_string()).collect();
    let orphans = repo.orphans_under("clusters/prod", &keep).unwrap();
    assert_eq!(orphans, vec!["clusters/prod/v1/configmaps/ns/orphan.yaml".to_string()]);
}

#[test]
fn deletes_remove_file_and_index_entry() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let repo = open_branch(&td, &remote, "work", "main");
    repo.checkout().unwrap();
    write(&repo, "a.yaml", "a: 1\n");
    repo.commit("seed", &identity()).unwrap();

    repo.apply_mutations(&[FileMutation {
        path: "a.yaml".to_string(),
        content: None,
    }])
    .unwrap();
    repo.commit("remove", &identity()).unwrap();
    assert_eq!(repo.read_file("a.yaml").unwrap(), None);
    assert!(repo.list_files_under("").unwrap().is_empty());
}

#[test]
fn metadata_counts_incoming_commits() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let a = open_branch(&td, &remote, "a", "main");
    a.checkout().unwrap();
    write(&a, "one.yaml", "1\n");
    a.commit("one", &identity()).unwrap();
    a.push().unwrap();

    let b = open_branch(&td, &remote, "b", "main");
    b.fetch().unwrap();
    b.checkout().unwrap();

    write(&a, "two.yaml", "2\n");
    a.commit("two", &identity()).unwrap();
    a.push().unwrap();

    let metadata = b.sync_and_get_metadata().unwrap();
    assert!(metadata.remote_exists);
    assert_eq!(metadata.incoming, 1);
    assert!(metadata.head.is_some());
}

#[test]
fn unsafe_paths_are_rejected_before_any_write() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let repo = open_branch(&td, &remote, "work", "main");
    repo.checkout().unwrap();
    let err = repo
        .apply_mutations(&[FileMutation {
            path: "../escape.yaml".to_string(),
            content: Some("x: 1\n".to_string()),
        }])
        .unwrap_err();
    assert!(matches!(err, GitError::UnsafePath(_)));
}
