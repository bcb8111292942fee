//! Recipe templates: `{variable}` extraction and expansion.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::Recipe;

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("valid variable pattern"));

/// Placeholder used when a variable has no value.
pub const MISSING_VALUE: &str = "...";

/// Distinct variable names in first-appearance order.
pub fn template_variables(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in VARIABLE.captures_iter(template) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Every variable a run can supply: the recipe sentence first, then any
/// placeholder that only appears in a task template.
pub fn recipe_variables(recipe: &Recipe) -> Vec<String> {
    let mut names = template_variables(&recipe.template);
    for tmpl in &recipe.task_templates {
        for name in template_variables(tmpl) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Fill every task template with the given values. Unknown or blank
/// values become `...`.
pub fn expand(recipe: &Recipe, values: &HashMap<String, String>) -> Vec<String> {
    recipe
        .task_templates
        .iter()
        .map(|tmpl| {
            VARIABLE
                .replace_all(tmpl, |cap: &regex::Captures| {
                    values
                        .get(&cap[1])
                        .map(|v| v.trim())
                        .filter(|v| !v.is_empty())
                        .unwrap_or(MISSING_VALUE)
                        .to_string()
                })
                .into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn travel() -> Recipe {
        Recipe {
            id: Uuid::new_v4(),
            name: "Travel Prep".into(),
            template: "Trip to {destination} for {days} days".into(),
            task_templates: vec![
                "Check visa requirements for {destination}".into(),
                "Book flights to {destination}".into(),
                "Pack {days} outfits".into(),
                "Charge powerbank".into(),
            ],
            color: "rose".into(),
            owner_id: Uuid::nil(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn variables_in_order_without_duplicates() {
        assert_eq!(
            template_variables("Review {week} and {week} then {topic}"),
            vec!["week".to_string(), "topic".to_string()]
        );
        assert!(template_variables("No placeholders").is_empty());
    }

    #[test]
    fn task_only_placeholders_are_listed() {
        let mut recipe = travel();
        recipe.task_templates.push("Ask {neighbour} to water plants".into());
        assert_eq!(recipe_variables(&recipe), vec!["destination", "days", "neighbour"]);

        let values = HashMap::from([("neighbour".to_string(), "Rui".to_string())]);
        assert_eq!(expand(&recipe, &values)[4], "Ask Rui to water plants");
    }

    #[test]
    fn expand_substitutes_every_occurrence() {
        let values = HashMap::from([
            ("destination".to_string(), "Lisbon".to_string()),
            ("days".to_string(), "5".to_string()),
        ]);
        let tasks = expand(&travel(), &values);
        assert_eq!(
            tasks,
            vec![
                "Check visa requirements for Lisbon",
                "Book flights to Lisbon",
                "Pack 5 outfits",
                "Charge powerbank",
            ]
        );
    }

    #[test]
    fn missing_values_become_ellipsis() {
        let values = HashMap::from([("destination".to_string(), "  ".to_string())]);
        let tasks = expand(&travel(), &values);
        assert_eq!(tasks[1], "Book flights to ...");
        assert_eq!(tasks[2], "Pack ... outfits");
    }
}
