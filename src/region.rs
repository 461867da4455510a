//! Constant zone table.

/// Static facts about one availability zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneInfo {
    /// Zone name, for example `fr-par-1`.
    pub zone: &'static str,
    /// Region the zone belongs to; regional APIs (private networks) are
    /// addressed by it.
    pub region: &'static str,
    /// Image label used when the configuration does not name one.
    pub default_image: &'static str,
}

/// Image used for zones outside the table (custom endpoints).
pub const FALLBACK_IMAGE: &str = "ubuntu_noble";

const ZONES: &[ZoneInfo] = &[
    ZoneInfo {
        zone: "fr-par-1",
        region: "fr-par",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "fr-par-2",
        region: "fr-par",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "fr-par-3",
        region: "fr-par",
        default_image: "ubuntu_jammy",
    },
    ZoneInfo {
        zone: "nl-ams-1",
        region: "nl-ams",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "nl-ams-2",
        region: "nl-ams",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "nl-ams-3",
        region: "nl-ams",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "pl-waw-1",
        region: "pl-waw",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "pl-waw-2",
        region: "pl-waw",
        default_image: "ubuntu_noble",
    },
    ZoneInfo {
        zone: "pl-waw-3",
        region: "pl-waw",
        default_image: "ubuntu_jammy",
    },
];

/// Looks a zone up in the table.
#[must_use]
pub fn lookup(zone: &str) -> Option<&'static ZoneInfo> {
    ZONES.iter().find(|info| info.zone == zone)
}

/// Region of `zone`: the table entry, or the zone with its trailing
/// `-<n>` removed.
#[must_use]
pub fn region_of(zone: &str) -> &str {
    lookup(zone).map_or_else(
        || zone.rsplit_once('-').map_or(zone, |(region, _)| region),
        |info| info.region,
    )
}

/// Default image for `zone`.
#[must_use]
pub fn default_image(zone: &str) -> &'static str {
    lookup(zone).map_or(FALLBACK_IMAGE, |info| info.default_image)
}
