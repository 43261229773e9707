//! Prompt templates for each generation call.
//!
//! Prompts are in Spanish because the documents are.

use serde_json::{Map, Value};

use celia_artifacts::{SectionDescriptor, section};
use celia_shared::{Citation, StructuredArtifact};

pub const STRUCTURED_SYSTEM: &str = "Eres un técnico de contratación pública. \
Respondes únicamente con un objeto JSON válido, sin texto adicional.";

pub const NARRATIVE_SYSTEM: &str = "Eres un redactor de expedientes de contratación pública. \
Redactas en español formal y administrativo.";

pub const REFINE_SYSTEM: &str = "Eres un experto en la Ley de Contratos del Sector Público. \
Devuelves solo la instrucción mejorada, sin comentarios.";

/// Prompts prepared once per request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Prompts {
    pub structured: String,
    pub narrative_instruction: String,
    pub context: String,
    /// Sources behind `context`, one per distinct source and page.
    pub citations: Vec<Citation>,
}

/// Drafting instruction for a section, before refinement.
pub fn base_instruction(section_id: &str) -> String {
    match section(section_id) {
        Some(descriptor) => format!(
            "Sección {} ({}): {}",
            descriptor.id, descriptor.title, descriptor.instruction
        ),
        None => format!("Sección {section_id}: extrae los datos relevantes del texto del usuario."),
    }
}

pub fn refine_prompt(base: &str, user_text: &str) -> String {
    format!(
        "Mejora la siguiente instrucción para que un modelo extraiga datos precisos \
del texto del usuario. Mantén el objetivo de la sección.\n\n\
Instrucción base:\n{base}\n\nTexto del usuario:\n{user_text}"
    )
}

pub fn structured_prompt(
    instruction: &str,
    section_id: &str,
    user_text: &str,
    context: &str,
    citations: &[Citation],
    sentinel: &str,
) -> String {
    let mut prompt = format!("{instruction}\n\n");
    prompt.push_str(&format!("Texto del usuario:\n{user_text}\n\n"));

    if !context.is_empty() {
        prompt.push_str(&format!("Contexto normativo:\n{context}\n\n"));
    }
    if !citations.is_empty() {
        prompt.push_str("Fuentes disponibles:\n");
        for c in citations {
            match c.page {
                Some(page) => prompt.push_str(&format!("- {} ({}, p. {page})\n", c.source_title, c.source_id)),
                None => prompt.push_str(&format!("- {} ({})\n", c.source_title, c.source_id)),
            }
        }
        prompt.push('\n');
    }

    match section(section_id) {
        Some(descriptor) => {
            prompt.push_str(&format!(
                "Devuelve un objeto JSON con la forma {{\"{section_id}\": {{...}}}} y estos campos:\n"
            ));
            prompt.push_str(&field_list(descriptor));
        }
        None => prompt.push_str(&format!(
            "Devuelve un objeto JSON con la forma {{\"{section_id}\": {{...}}}}.\n"
        )),
    }
    prompt.push_str(&format!(
        "\nNo inventes datos. Si un dato no aparece en el texto, usa \"{sentinel}\"."
    ));
    prompt
}

pub fn narrative_instruction(section_id: &str) -> String {
    let title = section(section_id).map(|d| d.title).unwrap_or(section_id);
    format!(
        "Redacta el apartado \"{title}\" de la Justificación de la Necesidad a partir de los \
datos estructurados. Menciona literalmente cada dato relevante y no añadas datos nuevos."
    )
}

pub fn narrative_prompt(instruction: &str, structured: &StructuredArtifact) -> String {
    let data = Value::Object(structured.data.clone());
    format!(
        "{instruction}\n\nDatos estructurados (sección {}):\n{data:#}\n\n\
Responde con un objeto JSON {{\"narrativa\": \"...\"}}.",
        structured.section_id
    )
}

pub fn repair_prompt(
    section_id: &str,
    data: &Map<String, Value>,
    errors: &[String],
    required: &[String],
    sentinel: &str,
) -> String {
    let data = Value::Object(data.clone());
    let mut prompt = format!(
        "El siguiente JSON de la sección {section_id} no supera la validación.\n\n\
JSON actual:\n{data:#}\n\nErrores:\n"
    );
    for error in errors {
        prompt.push_str(&format!("- {error}\n"));
    }
    if !required.is_empty() {
        prompt.push_str(&format!("\nCampos obligatorios: {}\n", required.join(", ")));
    }
    prompt.push_str(&format!(
        "\nCorrige el JSON y devuelve solo el objeto con la forma {{\"{section_id}\": {{...}}}}. \
No uses el valor \"{sentinel}\" en ningún campo."
    ));
    prompt
}

fn field_list(descriptor: &SectionDescriptor) -> String {
    descriptor
        .fields
        .iter()
        .map(|f| {
            let marker = if f.required { " (obligatorio)" } else { "" };
            format!("- {}: {}{marker}\n", f.name, f.kind.expected_type())
        })
        .collect()
}
