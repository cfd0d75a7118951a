//! Prompt builders for each reasoning stage.

use crate::context::SessionContext;
use crate::persona::Persona;
use crate::types::{GOAL_COMPLETE_TOKEN, InteractableElement, LogStep, Phase};

pub fn plan(goal: &str, persona: &Persona, ctx: &SessionContext, step: usize, max_steps: usize) -> String {
    format!(
        "You are simulating this shopper: {persona}\n\
         Goal: {goal}\n\
         Step {step} of {max_steps}. Current page type: {phase}.\n\
         Last action: {last}.\n\
         Search already submitted: {searched}.\n\n\
         In ONE short sentence, say what the shopper should do next.",
        persona = persona.description,
        phase = describe_phase(ctx.phase),
        last = ctx.last_action.as_deref().unwrap_or("none yet"),
        searched = if ctx.search_submitted { "yes" } else { "no" },
    )
}

pub fn observe(
    goal: &str,
    persona: &Persona,
    phase: Phase,
    element_count: usize,
    product_count: usize,
) -> String {
    format!(
        "You are simulating this shopper: {persona}\n\
         Goal: {goal}\n\
         The screenshot shows a {phase}. The page exposes {element_count} interactable \
         elements, {product_count} of which look like product results.\n\n\
         Describe in at most three sentences what this shopper notices on the page, \
         judged through their personality. Only describe what is visible. \
         If the goal is clearly achieved on this page, end with {token}.",
        persona = persona.description,
        phase = describe_phase(phase),
        token = GOAL_COMPLETE_TOKEN,
    )
}

pub fn decide(
    goal: &str,
    persona: &Persona,
    plan: &str,
    ctx: &SessionContext,
    elements: &[InteractableElement],
) -> String {
    let listing = elements
        .iter()
        .map(InteractableElement::describe)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are simulating this shopper: {persona}\n\
         Goal: {goal}\n\
         Plan for this step: {plan}\n\
         Current page type: {phase}. Search already submitted: {searched}.\n\n\
         Candidate elements (id, role, label, relevance score):\n{listing}\n\n\
         Choose exactly one action. Reply with a JSON object:\n\
         {{\"action\": \"click\" | \"type\" | \"scroll\" | \"wait\", \
         \"element_id\": <id for click/type>, \
         \"text\": <text for type>, \
         \"direction\": \"up\" | \"down\", \
         \"confidence\": <0.0-1.0>, \
         \"rationale\": <one sentence>}}",
        persona = persona.description,
        phase = describe_phase(ctx.phase),
        searched = if ctx.search_submitted { "yes" } else { "no" },
    )
}

pub fn reflect(goal: &str, plan: &str, action: &str, result: &str, phase: Phase) -> String {
    format!(
        "Goal: {goal}\n\
         Plan: {plan}\n\
         Action taken: {action}\n\
         Result: {result}\n\
         Page type before the action: {phase}.\n\n\
         In at most two sentences, assess whether the action had the expected effect. \
         If the goal has now been reached, end with {token}.",
        phase = describe_phase(phase),
        token = GOAL_COMPLETE_TOKEN,
    )
}

pub fn summary(goal: &str, persona: &Persona, steps: &[LogStep]) -> String {
    let reflections = steps
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.reflection.as_ref().map(|r| format!("{}. {}", i + 1, r)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "A simulated shopper ({persona}) tried to: {goal}\n\
         Their step-by-step reflections:\n{reflections}\n\n\
         Summarize in at most three sentences how the visit went and where the \
         shopper struggled.",
        persona = persona.description,
    )
}

fn describe_phase(phase: Phase) -> &'static str {
    match phase {
        Phase::Home => "home page",
        Phase::SearchResults => "search results page",
        Phase::ProductDetail => "product detail page",
        Phase::Unknown => "page of unknown type",
    }
}
