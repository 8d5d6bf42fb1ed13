//! EC nutrient split across the NPK / Calcium / Micro pumps.

use crate::models::NutritionConfig;

/// `(component, actuator role, default ratio %)`, in publish order.
pub const NUTRIENT_COMPONENTS: [(&str, &str, f64); 3] = [
    ("npk", "ec_npk_pump", 45.0),
    ("calcium", "ec_calcium_pump", 35.0),
    ("micro", "ec_micro_pump", 20.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioSource {
    Explicit,
    DosePerLiter,
    Default,
}

impl RatioSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatioSource::Explicit => "ratio_pct",
            RatioSource::DosePerLiter => "dose_ml_per_l",
            RatioSource::Default => "default",
        }
    }
}

/// Normalized ratios (sum 100) in [`NUTRIENT_COMPONENTS`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRatios {
    pub source: RatioSource,
    pub ratios: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDose {
    pub component: &'static str,
    pub role: &'static str,
    pub ratio_pct: f64,
    pub ml: f64,
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn positive(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0)
}

/// Explicit `ratio_pct` wins, then proportional `dose_ml_per_l`, then 45/35/20.
pub fn resolve_ratios(nutrition: Option<&NutritionConfig>) -> ComponentRatios {
    let pick = |f: fn(&crate::models::NutrientComponent) -> Option<f64>| -> [f64; 3] {
        NUTRIENT_COMPONENTS.map(|(name, _, _)| {
            positive(nutrition.and_then(|n| n.components.get(name)).and_then(f))
        })
    };

    let explicit = pick(|c| c.ratio_pct);
    let (source, raw) = if explicit.iter().sum::<f64>() > 0.0 {
        (RatioSource::Explicit, explicit)
    } else {
        let per_liter = pick(|c| c.dose_ml_per_l);
        if per_liter.iter().sum::<f64>() > 0.0 {
            (RatioSource::DosePerLiter, per_liter)
        } else {
            (RatioSource::Default, NUTRIENT_COMPONENTS.map(|(_, _, pct)| pct))
        }
    };

    let sum: f64 = raw.iter().sum();
    ComponentRatios {
        source,
        ratios: raw.map(|r| r / sum * 100.0),
    }
}

/// Splits `total_ml`; the last component takes `total - Σ previous`.
pub fn split_dose(total_ml: f64, ratios: &ComponentRatios) -> Vec<ComponentDose> {
    let mut allocated = 0.0;
    let last = NUTRIENT_COMPONENTS.len() - 1;

    NUTRIENT_COMPONENTS
        .iter()
        .zip(ratios.ratios)
        .enumerate()
        .map(|(i, (&(component, role, _), ratio_pct))| {
            let ml = if i == last {
                (total_ml - allocated).max(0.0)
            } else {
                round3(total_ml * ratio_pct / 100.0)
            };
            allocated += ml;
            ComponentDose { component, role, ratio_pct, ml }
        })
        .collect()
}

/// Pump run time for `ml` at `ml_per_sec`, never below 1 ms.
pub fn duration_ms(ml: f64, ml_per_sec: f64) -> i64 {
    (ml / ml_per_sec * 1000.0).round().max(1.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NutrientComponent;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn nutrition(components: &[(&str, NutrientComponent)]) -> NutritionConfig {
        NutritionConfig {
            components: components.iter().map(|(k, v)| (k.to_string(), *v)).collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn default_split_of_thirty_ml() {
        let ratios = resolve_ratios(None);
        assert_eq!(ratios.source, RatioSource::Default);
        let doses = split_dose(30.0, &ratios);
        let ml: Vec<f64> = doses.iter().map(|d| d.ml).collect();
        assert_eq!(ml, vec![13.5, 10.5, 6.0]);
        assert_eq!(doses[2].role, "ec_micro_pump");
    }

    #[test]
    fn explicit_ratios_win_over_dose_per_liter() {
        let cfg = nutrition(&[
            ("npk", NutrientComponent { ratio_pct: Some(50.0), dose_ml_per_l: Some(1.0) }),
            ("calcium", NutrientComponent { ratio_pct: Some(30.0), dose_ml_per_l: Some(1.0) }),
            ("micro", NutrientComponent { ratio_pct: Some(20.0), dose_ml_per_l: Some(1.0) }),
        ]);
        let ratios = resolve_ratios(Some(&cfg));
        assert_eq!(ratios.source, RatioSource::Explicit);
        assert_eq!(ratios.ratios, [50.0, 30.0, 20.0]);
    }

    #[test]
    fn dose_per_liter_is_proportional_and_normalized() {
        let cfg = nutrition(&[
            ("npk", NutrientComponent { ratio_pct: None, dose_ml_per_l: Some(2.0) }),
            ("calcium", NutrientComponent { ratio_pct: None, dose_ml_per_l: Some(1.0) }),
            ("micro", NutrientComponent { ratio_pct: None, dose_ml_per_l: Some(1.0) }),
        ]);
        let ratios = resolve_ratios(Some(&cfg));
        assert_eq!(ratios.source, RatioSource::DosePerLiter);
        assert_eq!(ratios.ratios, [50.0, 25.0, 25.0]);
    }

    #[test]
    fn explicit_ratios_are_normalized_to_100() {
        let cfg = nutrition(&[
            ("npk", NutrientComponent { ratio_pct: Some(2.0), dose_ml_per_l: None }),
            ("calcium", NutrientComponent { ratio_pct: Some(1.0), dose_ml_per_l: None }),
            ("micro", NutrientComponent { ratio_pct: Some(1.0), dose_ml_per_l: None }),
        ]);
        assert_eq!(resolve_ratios(Some(&cfg)).ratios, [50.0, 25.0, 25.0]);
    }

    #[test]
    fn duration_rounds_to_millis() {
        assert_eq!(duration_ms(13.5, 2.0), 6750);
        assert_eq!(duration_ms(1.0, 3.0), 333);
        assert_eq!(duration_ms(0.001, 5.0), 1);
    }

    proptest! {
        #[test]
        fn split_always_sums_to_total(
            total in 1.0f64..500.0,
            a in 0.0f64..100.0,
            b in 0.0f64..100.0,
            c in 1.0f64..100.0,
        ) {
            let total = round3(total);
            let cfg = nutrition(&[
                ("npk", NutrientComponent { ratio_pct: Some(a), dose_ml_per_l: None }),
                ("calcium", NutrientComponent { ratio_pct: Some(b), dose_ml_per_l: None }),
                ("micro", NutrientComponent { ratio_pct: Some(c), dose_ml_per_l: None }),
            ]);
            let ratios = resolve_ratios(Some(&cfg));
            prop_assert!((ratios.ratios.iter().sum::<f64>() - 100.0).abs() < 1e-9);

            let doses = split_dose(total, &ratios);
            let sum: f64 = doses.iter().map(|d| d.ml).sum();
            prop_assert!((sum - total).abs() < 1e-6);
            prop_assert!(doses.iter().all(|d| d.ml >= 0.0));
        }
    }
}
