//! Match outcome and the procedure that decodes proxy messages into it.
//!
//! A [`ResultCollector`] is fed every outcome-related message of a game. Once the stream is
//! over, [`ResultCollector::finish`] turns it into an immutable [`MatchResult`] whose outcome
//! is never [`Outcome::Unset`].

use std::{fmt, path::Path};

use serde::{Serialize, Serializer};
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    match_config::MatchConfig,
    protocol::{BotStatus, GameOutcome, ProxyMessage},
};

/// Final categorical result of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// First bot won.
    Player1Win,
    /// Second bot won.
    Player2Win,
    /// Draw.
    Tie,
    /// First bot crashed, second bot wins.
    Player1Crash,
    /// Second bot crashed, first bot wins.
    Player2Crash,
    /// First bot timed out, second bot wins.
    Player1Timeout,
    /// Second bot timed out, first bot wins.
    Player2Timeout,
    /// A bot could not join the game.
    InitializationError,
    /// The match could not be played or judged.
    Error,
    /// Nothing decided yet.
    #[default]
    Unset,
}

impl Outcome {
    /// Name used in exported results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Player1Win => "Player1Win",
            Outcome::Player2Win => "Player2Win",
            Outcome::Tie => "Tie",
            Outcome::Player1Crash => "Player1Crash",
            Outcome::Player2Crash => "Player2Crash",
            Outcome::Player1Timeout => "Player1TimeOut",
            Outcome::Player2Timeout => "Player2TimeOut",
            Outcome::InitializationError => "InitializationError",
            // an unset outcome is exported as an error
            Outcome::Error | Outcome::Unset => "Error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Who won a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Winner {
    /// Name of the winning bot.
    Bot(String),
    /// Both bots drew.
    Tie,
}

impl Serialize for Winner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Winner::Bot(name) => serializer.serialize_str(name),
            Winner::Tie => serializer.serialize_str("Tie"),
        }
    }
}

/// Decide the outcome of a game from both bots' statuses.
///
/// Rules are checked in order, the first one matching wins. `None` means no rule matched.
pub fn interpret(
    bot1: &str,
    status1: BotStatus,
    bot2: &str,
    status2: BotStatus,
) -> Option<(Outcome, Option<Winner>)> {
    use BotStatus::*;

    let win = |name: &str| Some(Winner::Bot(name.to_string()));
    let either = |s: BotStatus| status1 == s || status2 == s;

    if either(SC2Crash) {
        Some((Outcome::Error, None))
    } else if status1 == Crash {
        Some((Outcome::Player1Crash, win(bot2)))
    } else if status2 == Crash {
        Some((Outcome::Player2Crash, win(bot1)))
    } else if status1 == Timeout {
        Some((Outcome::Player1Timeout, win(bot2)))
    } else if status2 == Timeout {
        Some((Outcome::Player2Timeout, win(bot1)))
    } else if status1 == Victory {
        Some((Outcome::Player1Win, win(bot1)))
    } else if status1 == Defeat {
        Some((Outcome::Player2Win, win(bot2)))
    } else if either(Tie) {
        Some((Outcome::Tie, Some(Winner::Tie)))
    } else if either(InitializationError) {
        Some((Outcome::InitializationError, None))
    } else {
        None
    }
}

/// Finalized result of one match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchResult {
    #[serde(rename = "MatchID")]
    match_id: u32,
    bot1: String,
    bot2: String,
    winner: Option<Winner>,
    map: String,
    #[serde(rename = "Result")]
    outcome: Outcome,
    game_time: u64,
    game_time_formatted: Option<String>,
    time_stamp: Option<String>,
    bot1_avg_frame: f64,
    bot2_avg_frame: f64,
    replay_path: Option<String>,
}

impl MatchResult {
    /// Result of a match that could not be played.
    pub fn error(config: &MatchConfig, replays_directory: &Path) -> MatchResult {
        let mut collector = ResultCollector::new(config, replays_directory);
        collector.set_error();
        collector.finish()
    }

    /// Identifier of the match.
    pub fn match_id(&self) -> u32 {
        self.match_id
    }

    /// Name of the first bot.
    pub fn bot1(&self) -> &str {
        &self.bot1
    }

    /// Name of the second bot.
    pub fn bot2(&self) -> &str {
        &self.bot2
    }

    /// Map name.
    pub fn map(&self) -> &str {
        &self.map
    }

    /// Never [`Outcome::Unset`].
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Winner, absent for errors and initialization failures.
    pub fn winner(&self) -> Option<&Winner> {
        self.winner.as_ref()
    }

    /// Game loops played.
    pub fn game_time(&self) -> u64 {
        self.game_time
    }

    /// Game time as `HH:MM:SS`.
    pub fn game_time_formatted(&self) -> Option<&str> {
        self.game_time_formatted.as_deref()
    }

    /// UTC time the proxy reported completion.
    pub fn time_stamp(&self) -> Option<&str> {
        self.time_stamp.as_deref()
    }

    /// Average step time of the first and second bot.
    pub fn average_step_times(&self) -> (f64, f64) {
        (self.bot1_avg_frame, self.bot2_avg_frame)
    }

    /// Where the replay was written.
    pub fn replay_path(&self) -> Option<&str> {
        self.replay_path.as_deref()
    }

    /// JSON record of the result.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let winner = match &self.winner {
            Some(Winner::Bot(name)) => name.as_str(),
            Some(Winner::Tie) => "Tie",
            None => "-",
        };
        write!(
            f,
            "{} winner={} game_time={} avg_step=({:.2}, {:.2})",
            self.outcome, winner, self.game_time, self.bot1_avg_frame, self.bot2_avg_frame
        )
    }
}

/// Mutable accumulator fed by the supervisor while a game streams its results.
#[derive(Debug)]
pub struct ResultCollector {
    result: MatchResult,
    replays_directory: std::path::PathBuf,
}

impl ResultCollector {
    /// Empty result for `config`. An explicit replay path of the config is kept as is.
    pub fn new(config: &MatchConfig, replays_directory: &Path) -> ResultCollector {
        let replay_path = Some(config.replay_path())
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        ResultCollector {
            result: MatchResult {
                match_id: config.match_id(),
                bot1: config.player1().to_string(),
                bot2: config.player2().to_string(),
                winner: None,
                map: config.map().to_string(),
                outcome: Outcome::Unset,
                game_time: 0,
                game_time_formatted: None,
                time_stamp: None,
                bot1_avg_frame: 0.0,
                bot2_avg_frame: 0.0,
                replay_path,
            },
            replays_directory: replays_directory.to_path_buf(),
        }
    }

    /// True once an outcome has been decided.
    pub fn has_result(&self) -> bool {
        self.result.outcome != Outcome::Unset
    }

    /// Current outcome, possibly [`Outcome::Unset`].
    pub fn outcome(&self) -> Outcome {
        self.result.outcome
    }

    /// Record that the match failed.
    pub fn set_error(&mut self) {
        self.result.outcome = Outcome::Error;
        self.fill_replay_path();
    }

    /// Apply one outcome-related message.
    pub fn apply(&mut self, msg: &ProxyMessage) {
        if let Some(outcome) = msg.outcome() {
            self.apply_outcome(outcome);
            if outcome.is_error() {
                return;
            }
        }

        // zero means the proxy has no game time yet
        if let Some(game_time) = msg.game_time().filter(|loops| *loops > 0) {
            self.result.game_time = game_time;
            self.result.game_time_formatted = msg.game_time_formatted().map(str::to_string);
        }

        if let Some(frames) = msg.average_frame_time() {
            self.result.bot1_avg_frame = frames.get(&self.result.bot1).copied().unwrap_or(0.0);
            self.result.bot2_avg_frame = frames.get(&self.result.bot2).copied().unwrap_or(0.0);
        }

        if let Some(stamp) = msg.time_stamp() {
            self.result.time_stamp = Some(stamp.to_string());
        }

        self.fill_replay_path();
    }

    fn apply_outcome(&mut self, outcome: &GameOutcome) {
        if outcome.is_error() {
            self.result.outcome = Outcome::Error;
            return;
        }
        if let GameOutcome::Literal(other) = outcome {
            warn!("unexpected literal result '{other}'");
            return;
        }

        let bot1 = &self.result.bot1;
        let bot2 = &self.result.bot2;
        match interpret(bot1, outcome.status_of(bot1), bot2, outcome.status_of(bot2)) {
            Some((decided, winner)) => {
                debug!(outcome = %decided, ?winner, "result decided");
                self.result.outcome = decided;
                self.result.winner = winner;
            }
            None => warn!(?outcome, "result matches no known status"),
        }
    }

    /// Stamp the completion time with the current UTC time.
    pub fn stamp_completion(&mut self) {
        let format = format_description!("[day]-[month]-[year] [hour]-[minute]-[second]UTC");
        match OffsetDateTime::now_utc().format(format) {
            Ok(stamp) => self.result.time_stamp = Some(stamp),
            Err(e) => warn!("could not format completion time: {e}"),
        }
    }

    fn fill_replay_path(&mut self) {
        if self.result.replay_path.is_none() {
            let file = format!(
                "{}_{}_vs_{}.SC2Replay",
                self.result.match_id, self.result.bot1, self.result.bot2
            );
            self.result.replay_path =
                Some(self.replays_directory.join(file).to_string_lossy().into_owned());
        }
    }

    /// Final result; an undecided outcome becomes [`Outcome::Error`].
    pub fn finish(mut self) -> MatchResult {
        if !self.has_result() {
            self.set_error();
        }
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BotStatus::*;

    const STATUSES: [BotStatus; 8] = [
        Victory,
        Defeat,
        Tie,
        Crash,
        Timeout,
        SC2Crash,
        InitializationError,
        Unknown,
    ];

    fn decide(s1: BotStatus, s2: BotStatus) -> Option<(Outcome, Option<Winner>)> {
        interpret("A", s1, "B", s2)
    }

    fn bot(name: &str) -> Option<Winner> {
        Some(Winner::Bot(name.to_string()))
    }

    fn collector() -> ResultCollector {
        let config = MatchConfig::new("TestMap", "BotA", "BotB").with_match_id(7);
        ResultCollector::new(&config, Path::new("/replays"))
    }

    fn msg(text: &str) -> ProxyMessage {
        ProxyMessage::parse(text).unwrap()
    }

    #[test]
    fn single_rules() {
        assert_eq!(decide(SC2Crash, Unknown), Some((Outcome::Error, None)));
        assert_eq!(decide(Unknown, SC2Crash), Some((Outcome::Error, None)));
        assert_eq!(decide(Crash, Unknown), Some((Outcome::Player1Crash, bot("B"))));
        assert_eq!(decide(Unknown, Crash), Some((Outcome::Player2Crash, bot("A"))));
        assert_eq!(decide(Timeout, Unknown), Some((Outcome::Player1Timeout, bot("B"))));
        assert_eq!(decide(Unknown, Timeout), Some((Outcome::Player2Timeout, bot("A"))));
        assert_eq!(decide(Victory, Defeat), Some((Outcome::Player1Win, bot("A"))));
        assert_eq!(decide(Defeat, Victory), Some((Outcome::Player2Win, bot("B"))));
        assert_eq!(decide(Tie, Tie), Some((Outcome::Tie, Some(Winner::Tie))));
        assert_eq!(decide(Unknown, Tie), Some((Outcome::Tie, Some(Winner::Tie))));
        assert_eq!(
            decide(InitializationError, Unknown),
            Some((Outcome::InitializationError, None))
        );
        assert_eq!(
            decide(Unknown, InitializationError),
            Some((Outcome::InitializationError, None))
        );
        assert_eq!(decide(Unknown, Unknown), None);
    }

    #[test]
    fn first_rule_wins() {
        assert_eq!(decide(Crash, Crash), Some((Outcome::Player1Crash, bot("B"))));
        assert_eq!(decide(Crash, SC2Crash), Some((Outcome::Error, None)));
        assert_eq!(decide(Timeout, Crash), Some((Outcome::Player2Crash, bot("A"))));
        assert_eq!(decide(Timeout, Timeout), Some((Outcome::Player1Timeout, bot("B"))));
        assert_eq!(decide(Victory, Timeout), Some((Outcome::Player2Timeout, bot("A"))));
        assert_eq!(decide(Victory, Tie), Some((Outcome::Player1Win, bot("A"))));
        assert_eq!(decide(Defeat, Tie), Some((Outcome::Player2Win, bot("B"))));
        assert_eq!(
            decide(Tie, InitializationError),
            Some((Outcome::Tie, Some(Winner::Tie)))
        );
        // second bot's victory alone is not a rule
        assert_eq!(decide(Unknown, Victory), None);
    }

    #[test]
    fn every_combination_follows_the_table() {
        for s1 in STATUSES {
            for s2 in STATUSES {
                let expected = if s1 == SC2Crash || s2 == SC2Crash {
                    Some(Outcome::Error)
                } else if s1 == Crash {
                    Some(Outcome::Player1Crash)
                } else if s2 == Crash {
                    Some(Outcome::Player2Crash)
                } else if s1 == Timeout {
                    Some(Outcome::Player1Timeout)
                } else if s2 == Timeout {
                    Some(Outcome::Player2Timeout)
                } else if s1 == Victory {
                    Some(Outcome::Player1Win)
                } else if s1 == Defeat {
                    Some(Outcome::Player2Win)
                } else if s1 == Tie || s2 == Tie {
                    Some(Outcome::Tie)
                } else if s1 == InitializationError || s2 == InitializationError {
                    Some(Outcome::InitializationError)
                } else {
                    None
                };
                assert_eq!(decide(s1, s2).map(|d| d.0), expected, "{s1:?} {s2:?}");
            }
        }
    }

    #[test]
    fn victory_with_game_time() {
        let mut c = collector();
        c.apply(&msg(
            r#"{"Result":{"BotA":"Victory","BotB":"Defeat"},"GameTime":500,"GameTimeFormatted":"00:08:20"}"#,
        ));
        assert!(c.has_result());
        let result = c.finish();
        assert_eq!(result.outcome(), Outcome::Player1Win);
        assert_eq!(result.winner(), Some(&Winner::Bot("BotA".to_string())));
        assert_eq!(result.game_time(), 500);
        assert_eq!(result.game_time_formatted(), Some("00:08:20"));
        assert_eq!(
            result.replay_path(),
            Some(
                Path::new("/replays")
                    .join("7_BotA_vs_BotB.SC2Replay")
                    .to_str()
                    .unwrap()
            )
        );
    }

    #[test]
    fn float_game_time_decides_the_match() {
        let mut c = collector();
        c.apply(&msg(
            r#"{"Result":{"BotA":"Victory","BotB":"Defeat"},"GameTime":500.0}"#,
        ));
        let result = c.finish();
        assert_eq!(result.outcome(), Outcome::Player1Win);
        assert_eq!(result.game_time(), 500);
    }

    #[test]
    fn zero_game_time_keeps_the_previous_one() {
        let mut c = collector();
        c.apply(&msg(r#"{"GameTime":500,"GameTimeFormatted":"00:08:20"}"#));
        c.apply(&msg(r#"{"GameTime":0,"GameTimeFormatted":"00:00:00"}"#));
        let result = c.finish();
        assert_eq!(result.game_time(), 500);
        assert_eq!(result.game_time_formatted(), Some("00:08:20"));
    }

    #[test]
    fn literal_error_short_circuits() {
        let mut c = collector();
        c.apply(&msg(r#"{"Result":"Error","GameTime":20}"#));
        let result = c.finish();
        assert_eq!(result.outcome(), Outcome::Error);
        assert_eq!(result.winner(), None);
        assert_eq!(result.game_time(), 0);
    }

    #[test]
    fn average_frame_time_defaults_to_zero() {
        let mut c = collector();
        c.apply(&msg(r#"{"AverageFrameTime":{"BotB":1.5}}"#));
        assert!(!c.has_result());
        let result = c.finish();
        assert_eq!(result.average_step_times(), (0.0, 1.5));
        assert_eq!(result.outcome(), Outcome::Error);
    }

    #[test]
    fn explicit_replay_path_is_kept() {
        let config = MatchConfig::new("m", "a", "b").with_replay_path("/tmp/game.SC2Replay");
        let mut c = ResultCollector::new(&config, Path::new("/replays"));
        c.apply(&msg(r#"{"GameTime":3,"GameTimeFormatted":"00:00:00"}"#));
        assert_eq!(c.finish().replay_path(), Some("/tmp/game.SC2Replay"));
    }

    #[test]
    fn time_stamp_copied_and_stamped() {
        let mut c = collector();
        c.apply(&msg(r#"{"GameTime":1,"GameTimeFormatted":"x","TimeStamp":"proxy"}"#));
        c.stamp_completion();
        let stamp = c.finish().time_stamp().unwrap().to_string();
        assert!(stamp.ends_with("UTC"), "{stamp}");
        assert_eq!(stamp.len(), "01-02-2024 10-11-12UTC".len());
    }

    #[test]
    fn unfinished_result_is_error() {
        let result = collector().finish();
        assert_eq!(result.outcome(), Outcome::Error);
        assert_eq!(result.winner(), None);
    }

    #[test]
    fn exported_json() {
        let mut c = collector();
        c.apply(&msg(r#"{"Result":{"BotA":"Timeout","BotB":"Victory"}}"#));
        let json = c.finish().to_json();
        assert_eq!(json["MatchID"], 7);
        assert_eq!(json["Result"], "Player1TimeOut");
        assert_eq!(json["Winner"], "BotB");
        assert_eq!(json["Bot1AvgFrame"], 0.0);
        assert_eq!(json["Map"], "TestMap");
    }
}
