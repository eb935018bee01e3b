use std::collections::HashSet;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const SEED_MIN: u32 = 1;
pub const SEED_MAX: u32 = 999_999;

/// Servings used by `add_recipe` when neither the caller nor the
/// subscription supplies a household size.
pub const DEFAULT_SERVINGS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeSelection {
    pub recipe_id: String,
    pub servings: u32,
}

/// The week's selected recipes, as held in memory and in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekMenu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    pub seed: u32,
    pub version: u64,
    #[serde(default)]
    pub recipes: Vec<RecipeSelection>,
    pub updated_at: DateTime<Utc>,
}

impl WeekMenu {
    /// A brand-new, empty menu with a freshly drawn seed.
    #[must_use]
    pub fn fresh(subscription_id: Option<String>) -> Self {
        Self {
            id: None,
            subscription_id,
            seed: random_seed(),
            version: 1,
            recipes: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn from_stored(stored: StoredWeekMenu) -> Self {
        Self {
            id: Some(stored.id),
            subscription_id: Some(stored.subscription_id),
            seed: stored.seed,
            version: stored.version,
            recipes: stored.recipes,
            updated_at: stored.updated_at,
        }
    }

    #[must_use]
    pub fn to_record(&self, subscription_id: &str) -> WeekMenuRecord {
        WeekMenuRecord {
            subscription_id: subscription_id.to_string(),
            seed: self.seed,
            version: self.version,
            recipes: self.recipes.clone(),
        }
    }

    #[must_use]
    pub fn contains(&self, recipe_id: &str) -> bool {
        self.recipes.iter().any(|r| r.recipe_id == recipe_id)
    }

    #[must_use]
    pub fn servings_for(&self, recipe_id: &str) -> Option<u32> {
        self.recipes
            .iter()
            .find(|r| r.recipe_id == recipe_id)
            .map(|r| r.servings)
    }

    #[must_use]
    pub fn has_valid_seed(&self) -> bool {
        (SEED_MIN..=SEED_MAX).contains(&self.seed)
    }
}

/// Partial update merged into the current menu by `update_weekmenu`.
#[derive(Debug, Clone, Default)]
pub struct WeekMenuPatch {
    pub recipes: Option<Vec<RecipeSelection>>,
    pub subscription_id: Option<String>,
}

impl WeekMenuPatch {
    #[must_use]
    pub fn recipes(recipes: Vec<RecipeSelection>) -> Self {
        Self {
            recipes: Some(recipes),
            subscription_id: None,
        }
    }

    #[must_use]
    pub fn subscription(subscription_id: &str) -> Self {
        Self {
            recipes: None,
            subscription_id: Some(subscription_id.to_string()),
        }
    }

    /// Merge into `menu`, returning whether anything changed.
    pub fn apply(self, menu: &mut WeekMenu) -> bool {
        let mut changed = false;
        if let Some(recipes) = self.recipes {
            if recipes != menu.recipes {
                menu.recipes = recipes;
                changed = true;
            }
        }
        if let Some(sub) = self.subscription_id {
            if menu.subscription_id.as_deref() != Some(sub.as_str()) {
                menu.subscription_id = Some(sub);
                changed = true;
            }
        }
        changed
    }
}

/// Insert/update payload for the remote `weekmenus` resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekMenuRecord {
    pub subscription_id: String,
    pub seed: u32,
    pub version: u64,
    #[serde(default)]
    pub recipes: Vec<RecipeSelection>,
}

/// A row of the remote `weekmenus` resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWeekMenu {
    pub id: i64,
    pub subscription_id: String,
    pub seed: u32,
    pub version: u64,
    pub recipes: Vec<RecipeSelection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[must_use]
pub fn random_seed() -> u32 {
    rand::rng().random_range(SEED_MIN..=SEED_MAX)
}

/// Draw a seed guaranteed to differ from `previous`.
#[must_use]
pub fn random_seed_except(previous: u32) -> u32 {
    loop {
        let seed = random_seed();
        if seed != previous {
            return seed;
        }
    }
}

/// Servings floor: anything below one serving is stored as one.
#[must_use]
pub fn clamp_servings(servings: i64) -> u32 {
    u32::try_from(servings.max(1)).unwrap_or(u32::MAX)
}

/// Reorder `items` deterministically from `seed`, so a menu always presents
/// the recipe catalog in the same shuffled order.
pub fn order_for_seed<T>(seed: u32, items: &mut [T]) {
    let mut rng = StdRng::seed_from_u64(u64::from(seed));
    items.shuffle(&mut rng);
}

pub fn validate_recipes(recipes: &[RecipeSelection]) -> Result<()> {
    let mut seen = HashSet::new();
    for r in recipes {
        if r.recipe_id.trim().is_empty() {
            bail!("recipe_id must not be empty");
        }
        if r.servings == 0 {
            bail!("servings for recipe '{}' must be at least 1", r.recipe_id);
        }
        if !seen.insert(r.recipe_id.as_str()) {
            bail!("Duplicate recipe_id '{}'", r.recipe_id);
        }
    }
    Ok(())
}

/// Validate a write against the `weekmenus` resource.
pub fn validate_weekmenu_record(record: &WeekMenuRecord) -> Result<()> {
    if record.subscription_id.trim().is_empty() {
        bail!("subscription_id must not be empty");
    }
    if !(SEED_MIN..=SEED_MAX).contains(&record.seed) {
        bail!("seed must be between {SEED_MIN} and {SEED_MAX} (got {})", record.seed);
    }
    if record.version == 0 {
        bail!("version must be at least 1");
    }
    validate_recipes(&record.recipes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(id: &str, servings: u32) -> RecipeSelection {
        RecipeSelection {
            recipe_id: id.to_string(),
            servings,
        }
    }

    fn record() -> WeekMenuRecord {
        WeekMenuRecord {
            subscription_id: "sub-1".to_string(),
            seed: 4242,
            version: 3,
            recipes: vec![selection("lasagne", 4), selection("curry", 2)],
        }
    }

    #[test]
    fn test_fresh_menu() {
        let menu = WeekMenu::fresh(None);
        assert!(menu.id.is_none());
        assert!(menu.subscription_id.is_none());
        assert_eq!(menu.version, 1);
        assert!(menu.recipes.is_empty());
        assert!(menu.has_valid_seed());
    }

    #[test]
    fn test_random_seed_in_range() {
        for _ in 0..1000 {
            let seed = random_seed();
            assert!((SEED_MIN..=SEED_MAX).contains(&seed));
        }
    }

    #[test]
    fn test_random_seed_except_differs() {
        for _ in 0..100 {
            let seed = random_seed();
            assert_ne!(random_seed_except(seed), seed);
        }
    }

    #[test]
    fn test_clamp_servings() {
        assert_eq!(clamp_servings(0), 1);
        assert_eq!(clamp_servings(-3), 1);
        assert_eq!(clamp_servings(1), 1);
        assert_eq!(clamp_servings(6), 6);
        assert_eq!(clamp_servings(i64::MAX), u32::MAX);
    }

    #[test]
    fn test_order_for_seed_is_deterministic() {
        let ids: Vec<u32> = (0..50).collect();

        let mut a = ids.clone();
        let mut b = ids.clone();
        order_for_seed(1234, &mut a);
        order_for_seed(1234, &mut b);
        assert_eq!(a, b);

        // Still a permutation
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, ids);

        let mut c = ids.clone();
        order_for_seed(98765, &mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_patch_apply() {
        let mut menu = WeekMenu::fresh(None);
        assert!(!WeekMenuPatch::default().apply(&mut menu));

        assert!(WeekMenuPatch::recipes(vec![selection("soup", 2)]).apply(&mut menu));
        assert_eq!(menu.recipes.len(), 1);

        // Same recipes again is not a change
        assert!(!WeekMenuPatch::recipes(vec![selection("soup", 2)]).apply(&mut menu));

        assert!(WeekMenuPatch::subscription("sub-9").apply(&mut menu));
        assert_eq!(menu.subscription_id.as_deref(), Some("sub-9"));
        assert!(!WeekMenuPatch::subscription("sub-9").apply(&mut menu));
    }

    #[test]
    fn test_from_stored_and_to_record() {
        let now = Utc::now();
        let stored = StoredWeekMenu {
            id: 7,
            subscription_id: "sub-1".to_string(),
            seed: 11,
            version: 5,
            recipes: vec![selection("pho", 3)],
            created_at: now,
            updated_at: now,
        };
        let menu = WeekMenu::from_stored(stored);
        assert_eq!(menu.id, Some(7));
        assert_eq!(menu.servings_for("pho"), Some(3));
        assert!(menu.contains("pho"));
        assert!(!menu.contains("ramen"));

        let rec = menu.to_record("sub-1");
        assert_eq!(rec.seed, 11);
        assert_eq!(rec.version, 5);
        assert_eq!(rec.recipes, menu.recipes);
    }

    #[test]
    fn test_cache_json_shape() {
        let menu = WeekMenu::fresh(Some("sub-1".to_string()));
        let json = serde_json::to_value(&menu).unwrap();
        // No remote id yet, so it is omitted
        assert!(json.get("id").is_none());
        assert_eq!(json["subscription_id"], "sub-1");
        assert_eq!(json["version"], 1);

        let back: WeekMenu = serde_json::from_value(json).unwrap();
        assert_eq!(back, menu);
    }

    #[test]
    fn test_validate_record_ok() {
        assert!(validate_weekmenu_record(&record()).is_ok());
    }

    #[test]
    fn test_validate_record_seed_range() {
        let mut r = record();
        r.seed = 0;
        assert!(validate_weekmenu_record(&r).is_err());
        r.seed = 1_000_000;
        assert!(validate_weekmenu_record(&r).is_err());
        r.seed = SEED_MAX;
        assert!(validate_weekmenu_record(&r).is_ok());
    }

    #[test]
    fn test_validate_record_duplicates_and_servings() {
        let mut r = record();
        r.recipes.push(selection("lasagne", 1));
        assert!(validate_weekmenu_record(&r).is_err());

        let mut r = record();
        r.recipes[0].servings = 0;
        assert!(validate_weekmenu_record(&r).is_err());

        let mut r = record();
        r.recipes[0].recipe_id = "  ".to_string();
        assert!(validate_weekmenu_record(&r).is_err());
    }

    #[test]
    fn test_validate_record_version_and_subscription() {
        let mut r = record();
        r.version = 0;
        assert!(validate_weekmenu_record(&r).is_err());

        let mut r = record();
        r.subscription_id = String::new();
        assert!(validate_weekmenu_record(&r).is_err());
    }
}
