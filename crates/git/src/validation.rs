/// True when `path` is a plain relative path that stays inside the
/// repository: no absolute paths, no `..` or `.` segments, no empty
/// segments, and nothing under `.git`.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    if path.contains('\\') || path.contains('\0') {
        return false;
    }
    path.split('/').all(|segment| {
        !segment.is_empty() && segment != "." && segment != ".." && segment != ".git"
    })
}

pub fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty() && git2::Branch::name_is_valid(name).unwrap_or(false)
}
