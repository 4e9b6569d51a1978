//! Static catalog of weapons and special effects that can be skinned.
//!
//! The catalog maps class → slot → weapon key → display names. Model locations inside
//! the game archive are not stored; they are derived from the weapon key by
//! [`candidate_model_paths`], which lists the conventional locations in the order they
//! must be probed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerClass {
    Scout,
    Soldier,
    Pyro,
    Demoman,
    Heavy,
    Engineer,
    Medic,
    Sniper,
    Spy,
}

impl PlayerClass {
    pub const ALL: &[PlayerClass] = &[
        Self::Scout,
        Self::Soldier,
        Self::Pyro,
        Self::Demoman,
        Self::Heavy,
        Self::Engineer,
        Self::Medic,
        Self::Sniper,
        Self::Spy,
    ];

    /// Lowercase name as used in archive paths and mode strings.
    pub fn name(self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Soldier => "soldier",
            Self::Pyro => "pyro",
            Self::Demoman => "demoman",
            Self::Heavy => "heavy",
            Self::Engineer => "engineer",
            Self::Medic => "medic",
            Self::Sniper => "sniper",
            Self::Spy => "spy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|class| class.name() == name)
    }
}

impl fmt::Display for PlayerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlayerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown class '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WeaponSlot {
    Primary,
    Secondary,
    Melee,
}

impl fmt::Display for WeaponSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WeaponSlot::Primary => "Primary",
            WeaponSlot::Secondary => "Secondary",
            WeaponSlot::Melee => "Melee",
        };
        f.write_str(name)
    }
}

/// A weapon and its display names keyed by language code.
#[derive(Debug)]
pub struct WeaponEntry {
    pub key: &'static str,
    pub names: &'static [(&'static str, &'static str)],
}

impl WeaponEntry {
    /// Display name in `lang`, falling back to English and then the key itself.
    pub fn display_name(&self, lang: &str) -> &'static str {
        self.names
            .iter()
            .find(|(l, _)| *l == lang)
            .or_else(|| self.names.iter().find(|(l, _)| *l == "en"))
            .map(|(_, name)| *name)
            .unwrap_or(self.key)
    }
}

type SlotTable = &'static [(WeaponSlot, &'static [WeaponEntry])];

macro_rules! weapons {
    ($($key:literal => $en:literal),* $(,)?) => {
        &[$(WeaponEntry { key: $key, names: &[("en", $en)] }),*]
    };
}

static CATALOG: &[(PlayerClass, SlotTable)] = &[
    (
        PlayerClass::Scout,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_scattergun" => "Scattergun",
                    "c_double_barrel" => "Force-A-Nature",
                    "c_shortstop" => "Shortstop",
                    "c_soda_popper" => "Soda Popper",
                    "c_pep_scattergun" => "Baby Face's Blaster",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_pistol" => "Pistol",
                    "c_madmilk" => "Mad Milk",
                    "c_winger_pistol" => "Winger",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_bat" => "Bat",
                    "c_wooden_bat" => "Sandman",
                    "c_holymackerel" => "Holy Mackerel",
                    "c_candy_cane" => "Candy Cane",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Soldier,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_rocketlauncher" => "Rocket Launcher",
                    "c_directhit" => "Direct Hit",
                    "c_blackbox" => "Black Box",
                    "c_liberty_launcher" => "Liberty Launcher",
                    "c_rocketjumper" => "Rocket Jumper",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_shotgun" => "Shotgun",
                    "c_buffbanner" => "Buff Banner",
                    "c_battalion_buffbanner" => "Battalion's Backup",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_shovel" => "Shovel",
                    "c_pickaxe" => "Equalizer",
                    "c_market_gardener" => "Market Gardener",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Pyro,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_flamethrower" => "Flame Thrower",
                    "c_degreaser" => "Degreaser",
                    "c_drg_phlogistinator" => "Phlogistinator",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_shotgun" => "Shotgun",
                    "c_flaregun_pyro" => "Flare Gun",
                    "c_detonator" => "Detonator",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_fireaxe_pyro" => "Fire Axe",
                    "c_axtinguisher_pyro" => "Axtinguisher",
                    "c_powerjack" => "Powerjack",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Demoman,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_grenadelauncher" => "Grenade Launcher",
                    "c_lochnload" => "Loch-n-Load",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_stickybomb_launcher" => "Stickybomb Launcher",
                    "c_scottish_resistance" => "Scottish Resistance",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_bottle" => "Bottle",
                    "c_claymore" => "Eyelander",
                    "c_caber" => "Ullapool Caber",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Heavy,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_minigun" => "Minigun",
                    "c_tomislav" => "Tomislav",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_shotgun" => "Shotgun",
                    "c_sandwich" => "Sandvich",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_boxing_gloves" => "Killing Gloves of Boxing",
                    "c_eviction_notice" => "Eviction Notice",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Engineer,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_shotgun" => "Shotgun",
                    "c_frontierjustice" => "Frontier Justice",
                    "c_dex_shotgun" => "Widowmaker",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_pistol" => "Pistol",
                    "c_wrangler" => "Wrangler",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_wrench" => "Wrench",
                    "c_jag" => "Jag",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Medic,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_syringegun" => "Syringe Gun",
                    "c_crusaders_crossbow" => "Crusader's Crossbow",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_medigun" => "Medi Gun",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_bonesaw" => "Bonesaw",
                    "c_ubersaw" => "Ubersaw",
                    "c_amputator" => "Amputator",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Sniper,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_sniperrifle" => "Sniper Rifle",
                    "c_bow" => "Huntsman",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_smg" => "SMG",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_machete" => "Kukri",
                    "c_croc_knife" => "Bushwacka",
                ],
            ),
        ],
    ),
    (
        PlayerClass::Spy,
        &[
            (
                WeaponSlot::Primary,
                weapons![
                    "c_revolver" => "Revolver",
                    "c_ambassador" => "Ambassador",
                ],
            ),
            (
                WeaponSlot::Secondary,
                weapons![
                    "c_sapper" => "Sapper",
                ],
            ),
            (
                WeaponSlot::Melee,
                weapons![
                    "c_knife" => "Knife",
                    "c_eternal_reward" => "Your Eternal Reward",
                ],
            ),
        ],
    ),
];

/// All weapons of a class, in slot order.
pub fn weapons_for(class: PlayerClass) -> impl Iterator<Item = (WeaponSlot, &'static WeaponEntry)> {
    CATALOG
        .iter()
        .filter(move |(c, _)| *c == class)
        .flat_map(|(_, slots)| slots.iter())
        .flat_map(|(slot, weapons)| weapons.iter().map(move |w| (*slot, w)))
}

/// Look up a weapon key within a class.
pub fn find_weapon(class: PlayerClass, key: &str) -> Option<(WeaponSlot, &'static WeaponEntry)> {
    weapons_for(class).find(|(_, w)| w.key.eq_ignore_ascii_case(key))
}

/// Best-guess archive path of every weapon's model, keyed by weapon key.
pub fn default_model_paths() -> BTreeMap<&'static str, String> {
    CATALOG
        .iter()
        .flat_map(|(_, slots)| slots.iter())
        .flat_map(|(_, weapons)| weapons.iter())
        .map(|w| (w.key, format!("models/weapons/c_models/{0}/{0}.mdl", w.key)))
        .collect()
}

/// Every conventional archive location of a weapon model, highest priority first.
///
/// The order is significant: workshop-partner paths, then legacy workshop paths, then
/// plain weapon paths, then per-class player items. Reordering changes which model is
/// picked for keys that exist in more than one location.
pub fn candidate_model_paths(class: PlayerClass, key: &str) -> Vec<String> {
    vec![
        format!("models/workshop_partner/weapons/c_models/{key}/{key}.mdl"),
        format!("models/workshop_partner/weapons/c_models/{key}.mdl"),
        format!("models/workshop/weapons/c_models/{key}/{key}.mdl"),
        format!("models/workshop/weapons/c_models/{key}.mdl"),
        format!("models/weapons/c_models/{key}/{key}.mdl"),
        format!("models/weapons/c_models/{key}.mdl"),
        format!("models/weapons/c_items/{key}.mdl"),
        format!("models/player/items/{}/{key}.mdl", class.name()),
    ]
}

/// Special effects that only need a texture and a material, no model work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialEffect {
    CritHit,
    MiniCritHit,
}

impl SpecialEffect {
    pub const ALL: &[SpecialEffect] = &[Self::CritHit, Self::MiniCritHit];

    /// The mode name the effect is selected by.
    pub fn name(self) -> &'static str {
        match self {
            Self::CritHit => "critHIT",
            Self::MiniCritHit => "minicritHIT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|effect| effect.name().eq_ignore_ascii_case(name))
    }

    /// Directory of the effect texture inside the package, relative to `materials/`.
    pub fn material_dir(self) -> &'static str {
        "effects"
    }

    pub fn texture_name(self) -> &'static str {
        match self {
            Self::CritHit => "crit",
            Self::MiniCritHit => "minicrit",
        }
    }

    /// Files copied next to the texture when present in the effect's asset directory.
    pub fn companions(self) -> &'static [&'static str] {
        &["particles/crit.pcf"]
    }
}

/// True for keys made only of ASCII letters, digits and `_`, the shape of every model
/// name in the game archives.
pub fn is_valid_weapon_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// What a build produces: a weapon skin or a special-effect texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildTarget {
    Weapon { class: PlayerClass, weapon_key: String },
    SpecialEffect(SpecialEffect),
}

impl BuildTarget {
    pub fn weapon(class: PlayerClass, weapon_key: impl Into<String>) -> Self {
        BuildTarget::Weapon {
            class,
            weapon_key: weapon_key.into(),
        }
    }

    /// Parse a legacy mode string: a special-effect name, or `<class>_<weapon key>`.
    pub fn from_mode(mode: &str) -> Option<Self> {
        if let Some(effect) = SpecialEffect::from_name(mode) {
            return Some(BuildTarget::SpecialEffect(effect));
        }
        let (class, key) = mode.split_once('_')?;
        let class = PlayerClass::from_name(class)?;
        if key.is_empty() {
            return None;
        }
        Some(BuildTarget::weapon(class, key))
    }

    /// The legacy mode string, used in build identifiers.
    pub fn mode(&self) -> String {
        match self {
            BuildTarget::Weapon { class, weapon_key } => format!("{class}_{weapon_key}"),
            BuildTarget::SpecialEffect(effect) => effect.name().to_string(),
        }
    }

    pub fn is_special(&self) -> bool {
        matches!(self, BuildTarget::SpecialEffect(_))
    }

    pub fn weapon_key(&self) -> Option<&str> {
        match self {
            BuildTarget::Weapon { weapon_key, .. } => Some(weapon_key),
            BuildTarget::SpecialEffect(_) => None,
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mode())
    }
}
