use serde::Serialize;

use crate::dispatch::registry::ServiceSummary;

#[derive(Serialize)]
pub struct ListServicesResponse {
    pub services: Vec<ServiceSummary>,
}

impl ListServicesResponse {
    pub fn to_markdown(&self) -> String {
        if self.services.is_empty() {
            return "No services configured. Add `[[services]]` entries to promptrelay.toml.".to_string();
        }
        let mut out = String::from("| id | name | type | LLM models | VLM models |\n|---|---|---|---|---|\n");
        for s in &self.services {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                s.id,
                s.name,
                s.service_type.as_str(),
                mark_default(&s.llm_models, s.default_llm.as_deref()),
                mark_default(&s.vlm_models, s.default_vlm.as_deref()),
            ));
        }
        out
    }
}

fn mark_default(models: &[String], default: Option<&str>) -> String {
    if models.is_empty() {
        return "-".to_string();
    }
    models
        .iter()
        .map(|m| {
            if Some(m.as_str()) == default {
                format!("{m} (default)")
            } else {
                m.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    #[test]
    fn markdown_marks_default_model() {
        let resp = ListServicesResponse {
            services: vec![ServiceSummary {
                id: "ollama".into(),
                name: "Ollama".into(),
                service_type: ServiceType::Ollama,
                base_url: "http://localhost:11434".into(),
                api_key: String::new(),
                llm_models: vec!["qwen3:8b".into(), "llama3".into()],
                vlm_models: vec![],
                default_llm: Some("qwen3:8b".into()),
                default_vlm: None,
            }],
        };
        let md = resp.to_markdown();
        assert!(md.contains("qwen3:8b (default), llama3"));
        assert!(md.contains("| ollama | Ollama | ollama |"));
    }
}
