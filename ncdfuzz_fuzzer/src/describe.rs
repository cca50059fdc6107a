//! Provenance strings embedded in queue, hang and crash file names.

use crate::config::NAME_MAX;
use ncdfuzz_core::novelty::NewCoverage;
use std::fmt::Write;

/// Byte value written by a deterministic stage.
#[derive(Debug, Clone, Copy)]
pub enum StageVal {
    Le(i64),
    Be(i64),
}

/// Where the current input came from. The stage driver keeps this fresh
/// between executions.
#[derive(Debug, Clone, Default)]
pub struct StageInfo {
    /// Queue id of the entry being mutated.
    pub current_entry: usize,
    /// Splice partner, if the stage combined two entries.
    pub splicing_with: Option<usize>,
    /// Short stage name, e.g. "havoc".
    pub stage_short: String,
    /// Byte position targeted by deterministic stages.
    pub stage_cur_byte: Option<usize>,
    /// Value written at `stage_cur_byte`.
    pub stage_val: Option<StageVal>,
    /// Repetition count for stages without a position.
    pub stage_rep: u64,
    /// Description from a custom mutator, replacing the op fields.
    pub custom_describe: Option<String>,
}

impl StageInfo {
    /// Render the provenance suffix, truncated to `max_len`.
    pub fn describe(
        &self,
        run_time_ms: u64,
        new_bits: NewCoverage,
        new_partition: bool,
        max_len: usize,
    ) -> String {
        let mut ret = format!("src:{:06}", self.current_entry);
        if let Some(splice) = self.splicing_with {
            let _ = write!(ret, "+{:06}", splice);
        }
        let _ = write!(ret, ",time:{}", run_time_ms);

        if let Some(custom) = self.custom_describe.as_ref() {
            let _ = write!(ret, ",{}", custom);
        } else {
            let _ = write!(ret, ",op:{}", self.stage_short);
            if let Some(pos) = self.stage_cur_byte {
                let _ = write!(ret, ",pos:{}", pos);
                match self.stage_val {
                    Some(StageVal::Le(v)) => {
                        let _ = write!(ret, ",val:{:+}", v);
                    }
                    Some(StageVal::Be(v)) => {
                        let _ = write!(ret, ",val:be:{:+}", v);
                    }
                    None => {}
                }
            } else {
                let _ = write!(ret, ",rep:{}", self.stage_rep);
            }
        }

        if new_bits == NewCoverage::NewEdges {
            ret.push_str(",+cov");
        } else if new_bits == NewCoverage::None && new_partition {
            ret.push_str("+partition");
        }

        let mut limit = max_len.min(NAME_MAX).min(ret.len());
        while !ret.is_char_boundary(limit) {
            limit -= 1;
        }
        ret.truncate(limit);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_stage() {
        let stage = StageInfo {
            current_entry: 3,
            stage_short: "flip1".to_string(),
            stage_cur_byte: Some(17),
            stage_val: Some(StageVal::Le(-5)),
            ..StageInfo::default()
        };
        let s = stage.describe(1200, NewCoverage::NewEdges, false, NAME_MAX);
        assert_eq!(s, "src:000003,time:1200,op:flip1,pos:17,val:-5,+cov");
    }

    #[test]
    fn repetition_stage_with_splice_and_partition() {
        let stage = StageInfo {
            current_entry: 1,
            splicing_with: Some(9),
            stage_short: "havoc".to_string(),
            stage_rep: 4,
            ..StageInfo::default()
        };
        let s = stage.describe(7, NewCoverage::None, true, NAME_MAX);
        assert_eq!(s, "src:000001+000009,time:7,op:havoc,rep:4+partition");
    }

    #[test]
    fn custom_description_replaces_op_fields() {
        let stage = StageInfo {
            stage_short: "havoc".to_string(),
            custom_describe: Some("grammar:expr".to_string()),
            ..StageInfo::default()
        };
        let s = stage.describe(0, NewCoverage::NewCounts, false, NAME_MAX);
        assert_eq!(s, "src:000000,time:0,grammar:expr");
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let stage = StageInfo {
            stage_short: "x".repeat(400),
            ..StageInfo::default()
        };
        let s = stage.describe(0, NewCoverage::None, false, 64);
        assert_eq!(s.len(), 64);
    }

    #[test]
    fn big_endian_value_marker() {
        let stage = StageInfo {
            stage_short: "arith16".to_string(),
            stage_cur_byte: Some(2),
            stage_val: Some(StageVal::Be(33)),
            ..StageInfo::default()
        };
        let s = stage.describe(10, NewCoverage::None, false, NAME_MAX);
        assert_eq!(s, "src:000000,time:10,op:arith16,pos:2,val:be:+33");
    }
}
