use std::fmt::Display;

use serde::Serialize;

/// Display color of the tag rendered above a group of nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleColor {
    Blue,
    Orange,
    Purple,
}

impl Display for RoleColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleColor::Blue => write!(f, "blue"),
            RoleColor::Orange => write!(f, "orange"),
            RoleColor::Purple => write!(f, "purple"),
        }
    }
}

/// Presentation metadata for one role name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoleStyle {
    pub role: &'static str,
    pub color: RoleColor,
    /// Label shown in the cluster header
    pub label: String,
    pub css_class: String,
}

static ROLE_COLORS: &[(&str, RoleColor)] = &[
    ("agent", RoleColor::Orange),
    ("backend", RoleColor::Purple),
    ("dir", RoleColor::Purple),
    ("glb", RoleColor::Blue),
    ("master", RoleColor::Blue),
    ("masters", RoleColor::Blue),
    ("mrc", RoleColor::Blue),
    ("mysql", RoleColor::Orange),
    ("node", RoleColor::Orange),
    ("nodes", RoleColor::Orange),
    ("osd", RoleColor::Orange),
    ("peers", RoleColor::Blue),
    ("proxy", RoleColor::Orange),
    ("scalaris", RoleColor::Blue),
    ("slaves", RoleColor::Orange),
    ("web", RoleColor::Blue),
    ("workers", RoleColor::Orange),
];

/// Looks up the display style of a role. An unknown role is a configuration
/// error of the deployment, reported to whoever renders it.
pub fn role_style(role: &str) -> crate::error::Result<RoleStyle> {
    let (name, color) = ROLE_COLORS
        .iter()
        .find(|(name, _)| *name == role)
        .ok_or_else(|| crate::error::Error::UnknownRole(role.to_string()))?;
    let label = match *name {
        "dir" | "mrc" | "osd" => name.to_uppercase(),
        _ => name.to_string(),
    };
    Ok(RoleStyle {
        role: *name,
        color: *color,
        label,
        css_class: format!("cluster-{name}"),
    })
}
