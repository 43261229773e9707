//! Declarative field rules for the JN sections.
//!
//! Every section is one [`SectionDescriptor`] in a static table. The builder
//! and the validator both walk these descriptors; no section has its own
//! normalization code.

use celia_shared::Priority;

/// Value shape expected for a field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Text,
    /// Whole number, optionally bounded (inclusive).
    Integer { min: Option<i64>, max: Option<i64> },
    /// Non-negative amount, rounded half-up to two decimals.
    Currency,
    Boolean,
    Object(&'static [FieldRule]),
    List(ListRule),
}

impl FieldKind {
    /// JSON type name reported in missing-field descriptors.
    pub fn expected_type(&self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::Integer { .. } => "integer",
            Self::Currency => "number",
            Self::Boolean => "boolean",
            Self::Object(_) => "object",
            Self::List(_) => "array",
        }
    }
}

/// Item rules for a list field.
#[derive(Debug, Clone, Copy)]
pub struct ListRule {
    /// Item field holding a unique identifier, if items carry one.
    pub item_id: Option<&'static str>,
    pub item_fields: &'static [FieldRule],
    pub non_empty: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldRule {
    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }

    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }
}

/// Cross-field check: every `list[*].item_field` must be `<= bound_field`.
#[derive(Debug, Clone, Copy)]
pub struct BoundRule {
    pub list: &'static str,
    pub item_field: &'static str,
    pub bound_field: &'static str,
}

/// A document-level dependency implied by a section.
#[derive(Debug, Clone, Copy)]
pub struct DependencyRule {
    pub id: &'static str,
    pub reason: &'static str,
    pub priority: Priority,
    /// Boolean field that must be `true` for the dependency to apply.
    pub when: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct SectionDescriptor {
    pub id: &'static str,
    pub title: &'static str,
    /// Base drafting instruction handed to the generator.
    pub instruction: &'static str,
    pub fields: &'static [FieldRule],
    pub bounds: &'static [BoundRule],
    pub dependencies: &'static [DependencyRule],
}

impl SectionDescriptor {
    /// Dotted paths of every required field, nested objects included.
    ///
    /// List items are not expanded; a required list contributes its own name.
    pub fn required_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_required(self.fields, "", &mut paths);
        paths
    }

    /// Top-level field names, in declaration order.
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }
}

fn collect_required(fields: &[FieldRule], prefix: &str, out: &mut Vec<String>) {
    for field in fields.iter().filter(|f| f.required) {
        let path = format!("{prefix}{}", field.name);
        if let FieldKind::Object(inner) = field.kind {
            out.push(path.clone());
            collect_required(inner, &format!("{path}."), out);
        } else {
            out.push(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

use FieldKind::{Boolean, Currency, Text};

const OBJETIVO_FIELDS: &[FieldRule] = &[
    FieldRule::optional("objetivo_id", Text),
    FieldRule::required("descripcion", Text),
    FieldRule::required("indicador_exito", Text),
];

const ALTERNATIVA_FIELDS: &[FieldRule] = &[
    FieldRule::optional("alternativa_id", Text),
    FieldRule::required("descripcion", Text),
    FieldRule::optional("motivo_descarte", Text),
];

const MEDIOS_PROPIOS_FIELDS: &[FieldRule] = &[
    FieldRule::required("disponibles", Boolean),
    FieldRule::required("insuficiencia", Text),
];

const HITO_FIELDS: &[FieldRule] = &[
    FieldRule::optional("hito_id", Text),
    FieldRule::required("nombre", Text),
    FieldRule::required(
        "mes",
        FieldKind::Integer {
            min: Some(0),
            max: None,
        },
    ),
];

const LOTE_FIELDS: &[FieldRule] = &[
    FieldRule::optional("lote_id", Text),
    FieldRule::required("descripcion", Text),
    FieldRule::optional("importe", Currency),
];

static SECTIONS: &[SectionDescriptor] = &[
    SectionDescriptor {
        id: "JN.1",
        title: "Objeto y alcance",
        instruction: "Describe el objeto del contrato, su alcance y el ámbito de aplicación.",
        fields: &[
            FieldRule::required("objeto", Text),
            FieldRule::required("alcance", Text),
            FieldRule::required("ambito", Text),
        ],
        bounds: &[],
        dependencies: &[],
    },
    SectionDescriptor {
        id: "JN.2",
        title: "Contexto y problema",
        instruction: "Expón el contexto, el problema actual, su impacto y las consecuencias de no actuar.",
        fields: &[
            FieldRule::required("contexto", Text),
            FieldRule::required("dolor_actual", Text),
            FieldRule::optional("impacto", Text),
            FieldRule::optional("consecuencias_no_actuar", Text),
        ],
        bounds: &[],
        dependencies: &[],
    },
    SectionDescriptor {
        id: "JN.3",
        title: "Objetivos",
        instruction: "Enumera los objetivos de la contratación con un indicador de éxito medible para cada uno.",
        fields: &[FieldRule::required(
            "objetivos",
            FieldKind::List(ListRule {
                item_id: Some("objetivo_id"),
                item_fields: OBJETIVO_FIELDS,
                non_empty: true,
            }),
        )],
        bounds: &[],
        dependencies: &[],
    },
    SectionDescriptor {
        id: "JN.4",
        title: "Alternativas",
        instruction: "Analiza las alternativas consideradas, el motivo de descarte de cada una y la solución elegida.",
        fields: &[
            FieldRule::optional(
                "alternativas",
                FieldKind::List(ListRule {
                    item_id: Some("alternativa_id"),
                    item_fields: ALTERNATIVA_FIELDS,
                    non_empty: false,
                }),
            ),
            FieldRule::required("solucion_elegida", Text),
        ],
        bounds: &[],
        dependencies: &[],
    },
    SectionDescriptor {
        id: "JN.5",
        title: "Insuficiencia de medios",
        instruction: "Justifica la insuficiencia de medios propios y la idoneidad de la contratación externa.",
        fields: &[
            FieldRule::required("medios_propios", FieldKind::Object(MEDIOS_PROPIOS_FIELDS)),
            FieldRule::required("idoneidad", Text),
        ],
        bounds: &[],
        dependencies: &[],
    },
    SectionDescriptor {
        id: "JN.6",
        title: "Presupuesto",
        instruction: "Indica el presupuesto base de licitación sin IVA, el tipo de IVA, el valor estimado y si hay financiación europea.",
        fields: &[
            FieldRule::required("pbl_base", Currency),
            FieldRule::required(
                "iva_tipo",
                FieldKind::Integer {
                    min: Some(0),
                    max: Some(21),
                },
            ),
            FieldRule::optional("valor_estimado", Currency),
            FieldRule::optional("financiacion_ue", Boolean),
        ],
        bounds: &[],
        dependencies: &[
            DependencyRule {
                id: "presupuesto",
                reason: "El presupuesto condiciona el PCAP y la memoria económica",
                priority: Priority::High,
                when: None,
            },
            DependencyRule {
                id: "publicidad_fondos_ue",
                reason: "La financiación europea exige obligaciones de publicidad",
                priority: Priority::Medium,
                when: Some("financiacion_ue"),
            },
        ],
    },
    SectionDescriptor {
        id: "JN.7",
        title: "Plazo y cronograma",
        instruction: "Establece el plazo de ejecución en meses y los hitos principales con su mes previsto.",
        fields: &[
            FieldRule::required(
                "plazo_meses",
                FieldKind::Integer {
                    min: Some(1),
                    max: None,
                },
            ),
            FieldRule::optional(
                "hitos",
                FieldKind::List(ListRule {
                    item_id: Some("hito_id"),
                    item_fields: HITO_FIELDS,
                    non_empty: false,
                }),
            ),
        ],
        bounds: &[BoundRule {
            list: "hitos",
            item_field: "mes",
            bound_field: "plazo_meses",
        }],
        dependencies: &[DependencyRule {
            id: "cronograma",
            reason: "El plazo y los hitos alimentan el cronograma del PPT",
            priority: Priority::Medium,
            when: None,
        }],
    },
    SectionDescriptor {
        id: "JN.8",
        title: "División en lotes",
        instruction: "Indica si el contrato se divide en lotes, describe cada lote o justifica la no división.",
        fields: &[
            FieldRule::required("division_lotes", Boolean),
            FieldRule::optional(
                "lotes",
                FieldKind::List(ListRule {
                    item_id: Some("lote_id"),
                    item_fields: LOTE_FIELDS,
                    non_empty: false,
                }),
            ),
            FieldRule::optional("justificacion_no_division", Text),
        ],
        bounds: &[],
        dependencies: &[DependencyRule {
            id: "estructura_lotes_pcap",
            reason: "La división en lotes debe reflejarse en el PCAP",
            priority: Priority::High,
            when: Some("division_lotes"),
        }],
    },
];

/// All registered sections, in document order.
pub fn registry() -> &'static [SectionDescriptor] {
    SECTIONS
}

/// Look up a section descriptor by id (e.g. `JN.6`).
pub fn section(id: &str) -> Option<&'static SectionDescriptor> {
    SECTIONS.iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_eight_jn_sections() {
        let ids: Vec<_> = registry().iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            ["JN.1", "JN.2", "JN.3", "JN.4", "JN.5", "JN.6", "JN.7", "JN.8"]
        );
    }

    #[test]
    fn lookup_unknown_section() {
        assert!(section("JN.9").is_none());
        assert_eq!(section("JN.6").unwrap().title, "Presupuesto");
    }

    #[test]
    fn required_paths_expand_nested_objects() {
        let paths = section("JN.5").unwrap().required_paths();
        assert_eq!(
            paths,
            [
                "medios_propios",
                "medios_propios.disponibles",
                "medios_propios.insuficiencia",
                "idoneidad"
            ]
        );
    }

    #[test]
    fn required_paths_skip_optional_fields() {
        let paths = section("JN.6").unwrap().required_paths();
        assert_eq!(paths, ["pbl_base", "iva_tipo"]);
        let paths = section("JN.3").unwrap().required_paths();
        assert_eq!(paths, ["objetivos"]);
    }

    #[test]
    fn expected_type_names() {
        assert_eq!(Currency.expected_type(), "number");
        assert_eq!(
            FieldKind::Integer { min: None, max: None }.expected_type(),
            "integer"
        );
    }
}
