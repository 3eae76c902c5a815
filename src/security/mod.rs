//! Mandatory access control, process labelling and kernel-surface restriction.
//!
//! The steps run in a fixed order and every one of them is fatal:
//!
//! 1. [`Hardener::init`] detects the labelling subsystem. It has to run while the host's
//!    `/sys` is still visible, so it happens before the mount namespace is built.
//! 2. The AppArmor profile is applied, even when no name is configured.
//! 3. The process label is set.
//! 4. If restrictions are enabled, `/proc` and `/sys` are locked down.
//!
//! Steps 2 to 4 run in [`Hardener::apply`], after the container's mounts are in place and
//! before any identity change.

pub mod apparmor;
pub mod label;
pub mod restrict;

use tracing::debug;

use crate::config::Container;
use crate::error::Result;

pub const APPARMOR_PROFILE_KEY: &str = "apparmor_profile";
pub const PROCESS_LABEL_KEY: &str = "process_label";
pub const RESTRICTIONS_KEY: &str = "restrictions";

/// Scope handed to [`restrict::restrict`] when restrictions are enabled.
pub const RESTRICT_SCOPE: &str = "sys";

/// The security fields of a container's context map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub apparmor_profile: String,
    pub process_label: String,
    pub restrict: bool,
}

impl SecurityContext {
    pub fn from_container(container: &Container) -> SecurityContext {
        SecurityContext {
            apparmor_profile: container.context_value(APPARMOR_PROFILE_KEY).to_owned(),
            process_label: container.context_value(PROCESS_LABEL_KEY).to_owned(),
            restrict: !container.context_value(RESTRICTIONS_KEY).is_empty(),
        }
    }
}

/// Proof that the labelling subsystem has been initialized.
#[derive(Debug)]
pub struct Hardener<'a> {
    context: &'a SecurityContext,
}

impl<'a> Hardener<'a> {
    pub fn init(context: &'a SecurityContext) -> Result<Hardener<'a>> {
        let selinux = label::init();
        debug!(selinux, "labelling initialized");
        Ok(Hardener { context })
    }

    pub fn apply(self) -> Result<()> {
        let context = self.context;

        apparmor::apply_profile(&context.apparmor_profile)
            .map_err(|e| e.context("set apparmor profile"))?;
        label::set_process_label(&context.process_label)
            .map_err(|e| e.context("set process label"))?;
        if context.restrict {
            restrict::restrict(RESTRICT_SCOPE)?;
        }
        debug!(?context, "security hardening applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_fields_from_container() {
        let mut container = Container::default();
        container
            .context
            .insert(APPARMOR_PROFILE_KEY.into(), "docker-default".into());
        container
            .context
            .insert(RESTRICTIONS_KEY.into(), "true".into());

        let context = SecurityContext::from_container(&container);
        assert_eq!(context.apparmor_profile, "docker-default");
        assert_eq!(context.process_label, "");
        assert!(context.restrict);
    }

    #[test]
    fn empty_restrictions_value_disables_restriction() {
        let mut container = Container::default();
        container.context.insert(RESTRICTIONS_KEY.into(), "".into());
        assert!(!SecurityContext::from_container(&container).restrict);
    }

    #[test]
    fn empty_context_hardens_without_side_effects() {
        let context = SecurityContext::default();
        let hardener = Hardener::init(&context).unwrap();
        assert!(hardener.apply().is_ok());
    }
}
