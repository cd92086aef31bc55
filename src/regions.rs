use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::model::Coordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegionTier {
    Major = 1,
    Secondary = 2,
    Town = 3,
}

impl RegionTier {
    pub fn parse(value: u8) -> AppResult<Self> {
        match value {
            1 => Ok(RegionTier::Major),
            2 => Ok(RegionTier::Secondary),
            3 => Ok(RegionTier::Town),
            _ => Err(AppError::Parse(format!("invalid region tier: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Region {
    pub key: &'static str,
    /// Label in the local (reader) language.
    pub label: &'static str,
    /// Label in the destination's own script, appended to search queries.
    pub native_label: &'static str,
    pub lat: f64,
    pub lng: f64,
    pub tier: RegionTier,
}

impl Region {
    pub fn center(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }
}

const fn region(
    key: &'static str,
    label: &'static str,
    native_label: &'static str,
    lat: f64,
    lng: f64,
    tier: RegionTier,
) -> Region {
    Region {
        key,
        label,
        native_label,
        lat,
        lng,
        tier,
    }
}

pub static REGIONS: &[Region] = &[
    region("tokyo", "도쿄", "東京", 35.6812, 139.7671, RegionTier::Major),
    region("osaka", "오사카", "大阪", 34.7025, 135.4959, RegionTier::Major),
    region("kyoto", "교토", "京都", 35.0116, 135.7681, RegionTier::Major),
    region("fukuoka", "후쿠오카", "福岡", 33.5902, 130.4017, RegionTier::Major),
    region("sapporo", "삿포로", "札幌", 43.0618, 141.3545, RegionTier::Major),
    region("okinawa", "오키나와", "那覇", 26.2124, 127.6809, RegionTier::Major),
    region("nagoya", "나고야", "名古屋", 35.1709, 136.8815, RegionTier::Secondary),
    region("kobe", "고베", "神戸", 34.6901, 135.1955, RegionTier::Secondary),
    region("kitakyushu", "기타큐슈", "北九州", 33.8834, 130.8752, RegionTier::Secondary),
    region("kumamoto", "구마모토", "熊本", 32.8031, 130.7079, RegionTier::Secondary),
    region("nagasaki", "나가사키", "長崎", 32.7503, 129.8779, RegionTier::Secondary),
    region("kagoshima", "가고시마", "鹿児島", 31.5966, 130.5571, RegionTier::Secondary),
    region("hiroshima", "히로시마", "広島", 34.3853, 132.4553, RegionTier::Secondary),
    region("oita", "오이타", "大分", 33.2382, 131.6126, RegionTier::Secondary),
    region("beppu", "벳푸", "別府", 33.2846, 131.4914, RegionTier::Town),
    region("yufuin", "유후인", "由布院", 33.2656, 131.3553, RegionTier::Town),
    region("dazaifu", "다자이후", "太宰府", 33.5126, 130.5239, RegionTier::Town),
    region("hakone", "하코네", "箱根", 35.2324, 139.1069, RegionTier::Town),
    region("nara", "나라", "奈良", 34.6851, 135.8048, RegionTier::Town),
    region("kurokawa", "구로카와", "黒川温泉", 33.0758, 131.1415, RegionTier::Town),
];

/// Looks a region up by key or by either label.
pub fn find(key: &str) -> Option<&'static Region> {
    let needle = key.trim();
    if needle.is_empty() {
        return None;
    }
    REGIONS.iter().find(|region| {
        region.key.eq_ignore_ascii_case(needle)
            || region.label == needle
            || region.native_label == needle
    })
}

pub fn require(key: &str) -> AppResult<&'static Region> {
    find(key).ok_or_else(|| AppError::UnknownRegion(key.to_string()))
}

pub fn tier(tier: RegionTier) -> impl Iterator<Item = &'static Region> {
    REGIONS.iter().filter(move |region| region.tier == tier)
}

/// Closest region centroid within `max_km`, if any.
pub fn nearest(point: &Coordinates, max_km: f64) -> Option<&'static Region> {
    if !point.is_valid() {
        return None;
    }
    REGIONS
        .iter()
        .map(|region| (region, region.center().distance_km(point)))
        .filter(|(_, km)| *km <= max_km)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(region, _)| region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_by_key_or_label() {
        assert_eq!(find("Kumamoto").unwrap().key, "kumamoto");
        assert_eq!(find("유후인").unwrap().key, "yufuin");
        assert_eq!(find("福岡").unwrap().key, "fukuoka");
        assert!(find("atlantis").is_none());
        assert!(matches!(require("atlantis"), Err(AppError::UnknownRegion(_))));
    }

    #[test]
    fn nearest_respects_distance_ceiling() {
        let tenjin = Coordinates::new(33.5915, 130.3988);
        assert_eq!(nearest(&tenjin, 80.0).unwrap().key, "fukuoka");

        let kinrinko = Coordinates::new(33.2660, 131.3690);
        assert_eq!(nearest(&kinrinko, 80.0).unwrap().key, "yufuin");

        let seoul = Coordinates::new(37.5665, 126.9780);
        assert!(nearest(&seoul, 80.0).is_none());
    }

    #[test]
    fn tiers_partition_the_catalogue() {
        let total = tier(RegionTier::Major).count()
            + tier(RegionTier::Secondary).count()
            + tier(RegionTier::Town).count();
        assert_eq!(total, REGIONS.len());
        assert!(tier(RegionTier::Major).any(|region| region.key == "fukuoka"));
    }
}
