//! Build metadata baked in by `build.rs`, logged at startup and returned
//! by the `GET /` health check.

use std::fmt;

use once_cell::sync::Lazy;

/// What `build.rs` recorded about this build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    /// `"<build time> | <git label>"` unless overridden at build time.
    pub id: &'static str,
    pub time: &'static str,
    pub git: &'static str,
}

static CURRENT: Lazy<BuildInfo> = Lazy::new(|| BuildInfo {
    id: option_env!("CALLBACK_BUILD_ID").unwrap_or("unknown build"),
    time: option_env!("CALLBACK_BUILD_TIME").unwrap_or("unknown time"),
    git: option_env!("CALLBACK_BUILD_GIT").unwrap_or("unknown git"),
});

impl BuildInfo {
    pub fn current() -> &'static BuildInfo {
        &CURRENT
    }

    /// Whether the tree had uncommitted changes when this binary was built.
    pub fn is_dirty(&self) -> bool {
        self.git.ends_with("-dirty")
    }
}

/// `<package> <version> | <build id>`, with a marker for dirty builds.
#[derive(Debug, Clone, Copy)]
pub struct Banner<'a> {
    pub package: &'a str,
    pub version: &'a str,
    pub build: &'a BuildInfo,
}

impl fmt::Display for Banner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} | {}", self.package, self.version, self.build.id)?;
        if self.build.is_dirty() {
            f.write_str(" (uncommitted changes)")?;
        }
        Ok(())
    }
}

pub fn formatted_banner(package: &str, version: &str) -> String {
    Banner {
        package,
        version,
        build: BuildInfo::current(),
    }
    .to_string()
}
