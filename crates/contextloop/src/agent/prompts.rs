//! Prompt text the loop itself needs. Persona text belongs to agent
//! configuration, not here.

/// Persona used when predicting the next step, before an agent is chosen.
pub const GENERIC_PERSONA: &str = "You are an expert assistant. You solve goals step by step, \
using the functions available to you, and you know when a goal is done.";

pub const NEXT_STEP_QUESTION: &str = "Consider the above chat between a user and assistant. \
In your expert opinion, what is the best next step for the assistant? \
Answer with the step only.";

pub const EXHAUST_ALL_APPROACHES: &str = "Before giving up on the goal, try every approach \
available to you. Only call on_goal_failed once nothing else can work.";

pub const DEFAULT_LOOP_PREVENTION: &str = "Assistant, you must call a function. \
Continue working toward the goal, or call on_goal_achieved or on_goal_failed.";

pub const ROUTER_INSTRUCTIONS: &str = "You assign the next step of a task to exactly one agent. \
Reply with the agent's name and nothing else.";
