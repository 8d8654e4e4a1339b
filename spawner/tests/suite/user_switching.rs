//! End-to-end privilege lowering. These only run as root; elsewhere the
//! spawner keeps its own identity and there is nothing to switch.

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use apppool_spawner::AccountDatabase;
use apppool_spawner::Options;
use apppool_spawner::Spawner;
use apppool_spawner::SpawnerConfig;
use apppool_spawner::SystemAccounts;
use apppool_spawner::accounts::GroupAccount;
use apppool_spawner::accounts::UserAccount;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::harness::KillOnDrop;
use super::harness::START_TIMEOUT;
use super::harness::running_as_root;
use super::harness::shell_options;

#[derive(Debug, PartialEq, Eq)]
struct ObservedIdentity {
    uid: libc::uid_t,
    gid: libc::gid_t,
    groups: BTreeSet<libc::gid_t>,
}

/// `None` when not running as root or when `nobody` does not exist.
fn nobody() -> anyhow::Result<Option<UserAccount>> {
    if !running_as_root() {
        return Ok(None);
    }
    Ok(SystemAccounts.user_by_name("nobody")?)
}

/// An app root every user can enter and write to. Kept out of the default
/// temp location in case that sits under a private home directory.
fn shared_app_root() -> anyhow::Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("apppool-switch")
        .tempdir_in("/tmp")?;
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777))?;
    Ok(dir)
}

/// Records `id` output in the app root, then completes the handshake.
fn identity_options(app_root: &Path) -> Options {
    let script = "{ id -u; id -g; id -G; } > identity; \
                  printf 'socket: main;unix:/nonexistent/app.sock\\n\\n' >&3; \
                  exec 3>&-; exec sleep 60";
    shell_options(app_root, script, START_TIMEOUT)
}

async fn spawn_and_observe(options: &Options) -> anyhow::Result<ObservedIdentity> {
    let spawner = Spawner::new(SpawnerConfig::default());
    let process = spawner.spawn(options).await?;
    let _guard = KillOnDrop(process.pid());

    let output = std::fs::read_to_string(options.app_root.join("identity"))?;
    let mut lines = output.lines();
    let (Some(uid), Some(gid), Some(groups)) = (lines.next(), lines.next(), lines.next()) else {
        anyhow::bail!("unexpected id output: {output:?}");
    };
    Ok(ObservedIdentity {
        uid: uid.trim().parse()?,
        gid: gid.trim().parse()?,
        groups: groups
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()?,
    })
}

fn expected_groups(user: &UserAccount, gid: libc::gid_t) -> anyhow::Result<BTreeSet<libc::gid_t>> {
    let mut groups: BTreeSet<libc::gid_t> =
        SystemAccounts.default_groups(user)?.into_iter().collect();
    groups.insert(gid);
    Ok(groups)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn named_user_gets_its_uid_primary_group_and_default_groups() -> anyhow::Result<()> {
    let Some(nobody) = nobody()? else {
        return Ok(());
    };
    let app_root = shared_app_root()?;
    let mut options = identity_options(app_root.path());
    options.user = Some("nobody".to_string());

    let observed = spawn_and_observe(&options).await?;
    assert_eq!(
        observed,
        ObservedIdentity {
            uid: nobody.uid,
            gid: nobody.gid,
            groups: expected_groups(&nobody, nobody.gid)?,
        }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requesting_root_falls_back_to_the_default_user() -> anyhow::Result<()> {
    let Some(nobody) = nobody()? else {
        return Ok(());
    };
    let app_root = shared_app_root()?;
    let mut options = identity_options(app_root.path());
    options.user = Some("root".to_string());

    let observed = spawn_and_observe(&options).await?;
    assert_eq!(observed.uid, nobody.uid);
    assert_eq!(observed.gid, nobody.gid);
    assert!(!observed.groups.contains(&0), "{observed:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn named_group_replaces_the_primary_group() -> anyhow::Result<()> {
    let Some(nobody) = nobody()? else {
        return Ok(());
    };
    let mut group: Option<GroupAccount> = None;
    for name in ["users", "daemon", "nogroup"] {
        group = SystemAccounts
            .group_by_name(name)?
            .filter(|candidate| candidate.gid != 0 && candidate.gid != nobody.gid);
        if group.is_some() {
            break;
        }
    }
    let Some(group) = group else {
        return Ok(());
    };
    let app_root = shared_app_root()?;
    let mut options = identity_options(app_root.path());
    options.user = Some("nobody".to_string());
    options.group = Some(group.name.clone());

    let observed = spawn_and_observe(&options).await?;
    assert_eq!(
        observed,
        ObservedIdentity {
            uid: nobody.uid,
            gid: group.gid,
            groups: expected_groups(&nobody, group.gid)?,
        }
    );
    Ok(())
}
