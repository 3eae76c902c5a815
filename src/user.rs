//! Resolution of the container user against the container's `/etc/passwd` and `/etc/group`.

use std::fs::File;
use std::io::{self, BufRead, BufReader};

use crate::error::{Error, ErrorKind, Result};

pub const PASSWD_PATH: &str = "/etc/passwd";
pub const GROUP_PATH: &str = "/etc/group";

/// The identity the target program runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub supplementary_gids: Vec<u32>,
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn parse_passwd(reader: impl BufRead) -> io::Result<Vec<PasswdEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 4 || fields[0].starts_with('#') {
            continue;
        }
        let (Ok(uid), Ok(gid)) = (fields[2].parse(), fields[3].parse()) else {
            continue;
        };
        entries.push(PasswdEntry {
            name: fields[0].to_owned(),
            uid,
            gid,
        });
    }
    Ok(entries)
}

fn parse_group(reader: impl BufRead) -> io::Result<Vec<GroupEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 3 || fields[0].starts_with('#') {
            continue;
        }
        let Ok(gid) = fields[2].parse() else {
            continue;
        };
        let members = fields
            .get(3)
            .map(|m| {
                m.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        entries.push(GroupEntry {
            name: fields[0].to_owned(),
            gid,
            members,
        });
    }
    Ok(entries)
}

fn not_found(what: &'static str, name: &str) -> Error {
    Error::new()
        .kind(ErrorKind::Config)
        .cause(what)
        .detail(name)
}

/// Resolve `user`, `uid`, `user:group` or `uid:gid` from database readers.
///
/// An empty spec keeps the fallback identity. Numeric ids that have no entry are used as-is.
pub fn lookup_in(
    spec: &str,
    fallback_uid: u32,
    fallback_gid: u32,
    passwd: impl BufRead,
    group: impl BufRead,
) -> Result<ExecUser> {
    let (user_part, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let users = parse_passwd(passwd).map_err(|e| Error::from(e).cause("failed to read passwd"))?;
    let groups = parse_group(group).map_err(|e| Error::from(e).cause("failed to read group"))?;

    let mut exec_user = ExecUser {
        uid: fallback_uid,
        gid: fallback_gid,
        supplementary_gids: Vec::new(),
    };

    let mut user_name = None;
    if !user_part.is_empty() {
        let numeric = user_part.parse::<u32>().ok();
        let entry = users
            .iter()
            .find(|u| u.name == user_part || Some(u.uid) == numeric);
        match (entry, numeric) {
            (Some(entry), _) => {
                exec_user.uid = entry.uid;
                exec_user.gid = entry.gid;
                user_name = Some(entry.name.as_str());
            }
            (None, Some(uid)) => exec_user.uid = uid,
            (None, None) => return Err(not_found("unable to find user", user_part)),
        }
    }

    if let Some(group_part) = group_part.filter(|g| !g.is_empty()) {
        let numeric = group_part.parse::<u32>().ok();
        let entry = groups
            .iter()
            .find(|g| g.name == group_part || Some(g.gid) == numeric);
        match (entry, numeric) {
            (Some(entry), _) => exec_user.gid = entry.gid,
            (None, Some(gid)) => exec_user.gid = gid,
            (None, None) => return Err(not_found("unable to find group", group_part)),
        }
    }

    if let Some(name) = user_name {
        exec_user.supplementary_gids = groups
            .iter()
            .filter(|g| g.members.iter().any(|m| m == name))
            .map(|g| g.gid)
            .collect();
    }

    Ok(exec_user)
}

/// Resolve `spec` against the databases of the current root filesystem. Missing database
/// files read as empty.
pub fn get_user_group_supplementary(
    spec: &str,
    fallback_uid: u32,
    fallback_gid: u32,
) -> Result<ExecUser> {
    fn open_or_empty(path: &str) -> Result<Box<dyn BufRead>> {
        match File::open(path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(io::empty())),
            Err(e) => Err(Error::from(e).cause("failed to open user database").detail(path)),
        }
    }
    lookup_in(
        spec,
        fallback_uid,
        fallback_gid,
        open_or_empty(PASSWD_PATH)?,
        open_or_empty(GROUP_PATH)?,
    )
}
