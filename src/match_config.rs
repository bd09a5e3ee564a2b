//! Description of one match, sent to the proxy as the handshake payload.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Race a bot is expected to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Race {
    /// Terran.
    Terran,
    /// Zerg.
    Zerg,
    /// Protoss.
    Protoss,
    /// Picked by the game.
    Random,
}

impl FromStr for Race {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "t" | "terran" | "race.terran" | "1" => Ok(Race::Terran),
            "z" | "zerg" | "race.zerg" | "2" => Ok(Race::Zerg),
            "p" | "protoss" | "race.protoss" | "3" => Ok(Race::Protoss),
            "r" | "random" | "race.random" | "4" => Ok(Race::Random),
            _ => Err(format!("unknown race '{s}'")),
        }
    }
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Settings of a single match.
///
/// Built by the caller before a run and never modified afterwards; the serialized form is
/// exactly what the proxy expects after it reported `{"Status":"Connected"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchConfig {
    #[serde(rename = "MatchID", default)]
    match_id: u32,
    map: String,
    player1: String,
    player2: String,
    #[serde(default)]
    replay_path: String,
    #[serde(default = "default_max_game_time")]
    max_game_time: u32,
    #[serde(default = "default_true")]
    disable_debug: bool,
    #[serde(default)]
    real_time: bool,
    #[serde(default)]
    light_mode: bool,
    #[serde(default)]
    validate_race: bool,
    #[serde(default)]
    player1_race: Option<Race>,
    #[serde(default)]
    player2_race: Option<Race>,
    #[serde(default)]
    archon: bool,
}

fn default_max_game_time() -> u32 {
    MatchConfig::DEFAULT_MAX_GAME_TIME
}

fn default_true() -> bool {
    true
}

impl MatchConfig {
    /// Game loops after which the proxy ends the game.
    pub const DEFAULT_MAX_GAME_TIME: u32 = 60486;

    /// Create a config with default flags: debug disabled, not real time, no light mode.
    pub fn new(
        map: impl Into<String>,
        player1: impl Into<String>,
        player2: impl Into<String>,
    ) -> Self {
        Self {
            match_id: 0,
            map: map.into(),
            player1: player1.into(),
            player2: player2.into(),
            replay_path: String::new(),
            max_game_time: Self::DEFAULT_MAX_GAME_TIME,
            disable_debug: true,
            real_time: false,
            light_mode: false,
            validate_race: false,
            player1_race: None,
            player2_race: None,
            archon: false,
        }
    }

    /// Identifier used in results and replay names.
    #[must_use]
    pub fn with_match_id(self, match_id: u32) -> Self {
        Self { match_id, ..self }
    }

    /// Explicit replay path. When empty, the path is derived from the replays directory.
    #[must_use]
    pub fn with_replay_path(self, path: impl Into<String>) -> Self {
        Self {
            replay_path: path.into(),
            ..self
        }
    }

    /// Game loops after which the game is stopped.
    #[must_use]
    pub fn with_max_game_time(self, max_game_time: u32) -> Self {
        Self {
            max_game_time,
            ..self
        }
    }

    /// Whether bots may draw debug output.
    #[must_use]
    pub fn with_disable_debug(self, disable_debug: bool) -> Self {
        Self {
            disable_debug,
            ..self
        }
    }

    /// Run the game in real time instead of stepping.
    #[must_use]
    pub fn with_real_time(self, real_time: bool) -> Self {
        Self { real_time, ..self }
    }

    /// Lighter proxy checks.
    #[must_use]
    pub fn with_light_mode(self, light_mode: bool) -> Self {
        Self { light_mode, ..self }
    }

    /// Archon mode.
    #[must_use]
    pub fn with_archon(self, archon: bool) -> Self {
        Self { archon, ..self }
    }

    /// Races the proxy should check the bots against.
    #[must_use]
    pub fn with_races(self, player1: Option<Race>, player2: Option<Race>) -> Self {
        let mut config = Self {
            player1_race: player1,
            player2_race: player2,
            ..self
        };
        config.validate_race = config.validate_race && config.has_race();
        config
    }

    /// Ask the proxy to validate races. Ignored while no race is set.
    #[must_use]
    pub fn with_validate_race(self, validate_race: bool) -> Self {
        let validate_race = validate_race && self.has_race();
        Self {
            validate_race,
            ..self
        }
    }

    fn has_race(&self) -> bool {
        self.player1_race.is_some() || self.player2_race.is_some()
    }

    /// Identifier of the match.
    pub fn match_id(&self) -> u32 {
        self.match_id
    }

    /// Map name.
    pub fn map(&self) -> &str {
        &self.map
    }

    /// Name of the first bot.
    pub fn player1(&self) -> &str {
        &self.player1
    }

    /// Name of the second bot.
    pub fn player2(&self) -> &str {
        &self.player2
    }

    /// Explicit replay path, empty when unset.
    pub fn replay_path(&self) -> &str {
        &self.replay_path
    }

    /// Whether the proxy validates races.
    pub fn validate_race(&self) -> bool {
        self.validate_race
    }

    /// Handshake payload.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for MatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} vs {} on {}",
            self.match_id, self.player1, self.player2, self.map
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn handshake_payload_field_names() {
        let config = MatchConfig::new("TestMap", "BotA", "BotB").with_races(Some(Race::Zerg), None);
        let value: Value = serde_json::from_str(&config.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "Map": "TestMap",
                "MaxGameTime": 60486,
                "Player1": "BotA",
                "Player2": "BotB",
                "ReplayPath": "",
                "MatchID": 0,
                "DisableDebug": true,
                "RealTime": false,
                "LightMode": false,
                "ValidateRace": false,
                "Player1Race": "Zerg",
                "Player2Race": null,
                "Archon": false,
            })
        );
    }

    #[test]
    fn validate_race_needs_a_race() {
        let config = MatchConfig::new("m", "a", "b").with_validate_race(true);
        assert!(!config.validate_race());

        let config = MatchConfig::new("m", "a", "b")
            .with_races(None, Some(Race::Protoss))
            .with_validate_race(true);
        assert!(config.validate_race());
    }

    #[test]
    fn deserialize_uses_defaults() {
        let config: MatchConfig =
            serde_json::from_str(r#"{"Map":"m","Player1":"a","Player2":"b"}"#).unwrap();
        assert_eq!(config, MatchConfig::new("m", "a", "b"));
    }

    #[test]
    fn race_from_str() {
        for s in ["R", "Random", "Race.Random", "4"] {
            assert_eq!(s.parse::<Race>(), Ok(Race::Random));
        }
        for s in ["p", "PROTOSS", "race.protoss", "3"] {
            assert_eq!(s.parse::<Race>(), Ok(Race::Protoss));
        }
        assert_eq!("T".parse::<Race>(), Ok(Race::Terran));
        assert_eq!("2".parse::<Race>(), Ok(Race::Zerg));
        assert!("whatever".parse::<Race>().is_err());
    }
}
