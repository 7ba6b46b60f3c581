use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Per-voxel tissue class.
///
/// Discriminants are the stored label values (0 = background, 1 = visceral
/// fat, 2 = subcutaneous fat, 3 = organ/muscle).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TissueLabel {
    #[default]
    Background = 0,
    VisceralFat = 1,
    SubcutaneousFat = 2,
    OrganOrMuscle = 3,
}

impl TissueLabel {
    pub const ALL: [TissueLabel; 4] = [
        TissueLabel::Background,
        TissueLabel::VisceralFat,
        TissueLabel::SubcutaneousFat,
        TissueLabel::OrganOrMuscle,
    ];

    pub fn is_body(self) -> bool {
        !matches!(self, TissueLabel::Background)
    }

    pub fn is_fat(self) -> bool {
        matches!(self, TissueLabel::VisceralFat | TissueLabel::SubcutaneousFat)
    }

    /// Overlay color, `None` for background which stays grayscale.
    pub fn overlay_color(self) -> Option<[u8; 3]> {
        match self {
            TissueLabel::Background => None,
            TissueLabel::VisceralFat => Some([255, 165, 0]),
            TissueLabel::SubcutaneousFat => Some([255, 255, 0]),
            TissueLabel::OrganOrMuscle => Some([0, 128, 255]),
        }
    }
}

/// A tissue that can be requested as a mesh in a generated model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TissueKind {
    Body,
    VisceralFat,
    SubcutaneousFat,
    Organs,
}

impl TissueKind {
    /// Tissues meshed when the caller does not ask for a specific set.
    pub const DEFAULT_SET: [TissueKind; 3] =
        [TissueKind::Body, TissueKind::VisceralFat, TissueKind::Organs];

    pub fn name(self) -> &'static str {
        match self {
            TissueKind::Body => "body",
            TissueKind::VisceralFat => "visceral_fat",
            TissueKind::SubcutaneousFat => "subcutaneous_fat",
            TissueKind::Organs => "organs",
        }
    }

    /// Flat RGBA color used for the mesh material.
    pub fn rgba(self) -> [u8; 4] {
        match self {
            TissueKind::Body => [200, 200, 200, 255],
            TissueKind::VisceralFat => [255, 165, 0, 255],
            TissueKind::SubcutaneousFat => [255, 255, 0, 255],
            TissueKind::Organs => [0, 128, 255, 255],
        }
    }

    /// Opacity hint for viewers. The mesh color itself is always opaque.
    pub fn opacity(self) -> f32 {
        match self {
            TissueKind::Body => 0.35,
            _ => 1.0,
        }
    }

    pub fn target_faces(self) -> usize {
        match self {
            TissueKind::Body => 5000,
            _ => 8000,
        }
    }

    /// Fat is legitimately scattered, so its small components are kept.
    pub fn keep_small_objects(self) -> bool {
        matches!(self, TissueKind::VisceralFat | TissueKind::SubcutaneousFat)
    }
}

impl fmt::Display for TissueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TissueKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "body" => Ok(TissueKind::Body),
            "visceral_fat" => Ok(TissueKind::VisceralFat),
            "subcutaneous_fat" => Ok(TissueKind::SubcutaneousFat),
            "organs" => Ok(TissueKind::Organs),
            other => Err(Error::UnknownTissue(other.to_string())),
        }
    }
}

/// Which neighbours take part in morphology and connectivity.
///
/// `Planar` treats every z-slice independently, which is how single slices
/// (stored as depth-1 volumes) and the per-slice erosion are processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Neighborhood {
    Planar,
    Volumetric,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    InstanceNumber,
    ImagePositionPatient,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tissue_kind_parses_its_own_name() {
        for kind in [
            TissueKind::Body,
            TissueKind::VisceralFat,
            TissueKind::SubcutaneousFat,
            TissueKind::Organs,
        ] {
            assert_eq!(kind.name().parse::<TissueKind>().ok(), Some(kind));
        }
    }

    #[test]
    fn unknown_tissue_is_rejected() {
        let err = "bone".parse::<TissueKind>().unwrap_err();
        assert!(matches!(err, Error::UnknownTissue(name) if name == "bone"));
    }

    #[test]
    fn only_fat_keeps_small_objects() {
        assert!(TissueKind::VisceralFat.keep_small_objects());
        assert!(TissueKind::SubcutaneousFat.keep_small_objects());
        assert!(!TissueKind::Body.keep_small_objects());
        assert!(!TissueKind::Organs.keep_small_objects());
    }

    #[test]
    fn background_has_no_overlay_color() {
        assert!(TissueLabel::Background.overlay_color().is_none());
        assert!(!TissueLabel::Background.is_body());
        assert!(TissueLabel::VisceralFat.is_fat());
        assert!(!TissueLabel::OrganOrMuscle.is_fat());
    }
}
