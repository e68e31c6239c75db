//! Phase state machine driving the optimization orchestrator (spec.md
//! §4.10, C10).

use crate::config::OptimizationConfig;
use crate::domain::optimization::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Refine,
    Research,
    Restructure,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub enum Event {
    IterStart,
    Escalate,
    PhaseTimeout,
    BacktestOk,
    CompileError,
    TransientError,
    NoChange,
    ChangeApplied { is_restructure: bool },
    Verdict(Verdict),
    CheckpointSaved,
    CriteriaMet,
    ResearchDone { brief_present: bool },
}

/// Per-phase counters, reset on every phase entry (spec.md §4.10).
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseCounters {
    pub fix_attempts: u32,
    pub transient_failures: u32,
    pub neutral_streak: u32,
    pub no_change_count: u32,
    pub phase_iter_count: u32,
}

pub struct PhaseMachine {
    pub phase: Phase,
    pub counters: PhaseCounters,
    pub phase_cycles: u32,
    pub needs_rebuild: bool,
    config: OptimizationConfig,
}

impl PhaseMachine {
    /// `initial` is the phase persisted in parameter history, or `Refine`
    /// for a fresh session.
    pub fn new(initial: Phase, config: OptimizationConfig) -> Self {
        Self {
            phase: initial,
            counters: PhaseCounters::default(),
            phase_cycles: 0,
            needs_rebuild: false,
            config,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.counters = PhaseCounters::default();
    }

    fn phase_iter_budget(&self, phase: Phase) -> u32 {
        let fraction = match phase {
            Phase::Refine => 0.4,
            Phase::Research => 0.2,
            Phase::Restructure => 0.4,
            Phase::Done => return u32::MAX,
        };
        let allocated = (self.config.max_iter as f64 * fraction).round() as u32;
        allocated.max(self.config.min_phase_iters)
    }

    /// Applies one event to the machine, per the transition table of
    /// spec.md §4.10.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::IterStart => {
                self.counters.phase_iter_count += 1;
            }
            Event::Escalate => match self.phase {
                Phase::Refine
                    if self.counters.neutral_streak >= 3 || self.counters.no_change_count >= 2 =>
                {
                    self.enter(Phase::Research);
                }
                Phase::Research | Phase::Restructure if self.counters.no_change_count >= 2 => {
                    self.enter(Phase::Restructure);
                }
                _ => {}
            },
            Event::ResearchDone { brief_present } => {
                if self.phase == Phase::Research && brief_present {
                    self.enter(Phase::Restructure);
                }
            }
            Event::PhaseTimeout => {
                if self.phase != Phase::Done
                    && self.counters.phase_iter_count > self.phase_iter_budget(self.phase)
                {
                    match self.phase {
                        Phase::Refine => self.enter(Phase::Research),
                        Phase::Research => self.enter(Phase::Restructure),
                        Phase::Restructure => {
                            self.phase_cycles += 1;
                            if self.phase_cycles >= self.config.max_cycles {
                                self.enter(Phase::Done);
                            } else {
                                self.enter(Phase::Refine);
                            }
                        }
                        Phase::Done => {}
                    }
                }
            }
            Event::CriteriaMet => self.enter(Phase::Done),
            Event::Verdict(v) => match v {
                Verdict::Improved => self.counters.neutral_streak = 0,
                Verdict::Neutral => self.counters.neutral_streak += 1,
                Verdict::Degraded => self.counters.neutral_streak = 0,
            },
            Event::ChangeApplied { is_restructure } => {
                if is_restructure {
                    self.needs_rebuild = true;
                }
            }
            Event::NoChange => {
                self.counters.no_change_count += 1;
            }
            Event::CompileError => {
                self.counters.fix_attempts += 1;
            }
            Event::TransientError => {
                self.counters.transient_failures += 1;
            }
            Event::BacktestOk | Event::CheckpointSaved => {}
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> PhaseMachine {
        PhaseMachine::new(Phase::Refine, OptimizationConfig::default())
    }

    #[test]
    fn three_neutral_verdicts_escalate_refine_to_research() {
        let mut m = machine();
        for _ in 0..3 {
            m.handle(Event::Verdict(Verdict::Neutral));
        }
        m.handle(Event::Escalate);
        assert_eq!(m.phase, Phase::Research);
    }

    #[test]
    fn research_done_with_brief_and_two_no_change_escalates_to_restructure() {
        let mut m = machine();
        for _ in 0..3 {
            m.handle(Event::Verdict(Verdict::Neutral));
        }
        m.handle(Event::Escalate);
        assert_eq!(m.phase, Phase::Research);

        m.handle(Event::ResearchDone { brief_present: true });
        assert_eq!(m.phase, Phase::Restructure);

        m.handle(Event::NoChange);
        m.handle(Event::NoChange);
        m.handle(Event::Escalate);
        assert_eq!(m.phase, Phase::Restructure);
    }

    #[test]
    fn restructure_timeout_returns_to_refine_until_max_cycles_then_done() {
        let config = OptimizationConfig { max_cycles: 2, min_phase_iters: 1, ..OptimizationConfig::default() };
        let mut m = PhaseMachine::new(Phase::Restructure, config);
        let budget = m.phase_iter_budget(Phase::Restructure);
        for _ in 0..=budget {
            m.handle(Event::IterStart);
        }
        m.handle(Event::PhaseTimeout);
        assert_eq!(m.phase, Phase::Refine);
        assert_eq!(m.phase_cycles, 1);

        m.enter(Phase::Restructure);
        for _ in 0..=budget {
            m.handle(Event::IterStart);
        }
        m.handle(Event::PhaseTimeout);
        assert_eq!(m.phase, Phase::Done);
        assert_eq!(m.phase_cycles, 2);
    }

    #[test]
    fn counters_reset_on_phase_entry() {
        let mut m = machine();
        m.counters.neutral_streak = 5;
        m.enter(Phase::Research);
        assert_eq!(m.counters.neutral_streak, 0);
    }

    #[test]
    fn criteria_met_is_terminal() {
        let mut m = machine();
        m.handle(Event::CriteriaMet);
        assert!(m.is_done());
    }
}
