use crate::{EntityId, Result, StoryGraphError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of world state: character, location, item, rule, etc.
///
/// `id` is immutable once created. Parent/child links are plain id lists;
/// they may dangle after a deletion until a consuming layer reconciles them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub parent_ids: Vec<EntityId>,
    #[serde(default)]
    pub child_ids: Vec<EntityId>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub update_image: bool,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            long_description: String::new(),
            entity_type: String::new(),
            parent_ids: Vec::new(),
            child_ids: Vec::new(),
            image_ref: None,
            update_image: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.long_description = description.into();
        self
    }

    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    pub fn with_parent(mut self, parent: impl Into<EntityId>) -> Self {
        self.parent_ids.push(parent.into());
        self
    }

    pub fn with_child(mut self, child: impl Into<EntityId>) -> Self {
        self.child_ids.push(child.into());
        self
    }

    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    /// Read a patchable field as text. Returns `None` for unknown fields
    /// and for fields that are not plain text.
    pub fn text_field(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            "long_description" => Some(&self.long_description),
            "type" => Some(&self.entity_type),
            "image_ref" => self.image_ref.as_deref(),
            _ => None,
        }
    }

    /// Overwrite a field from a JSON value. Text fields take strings,
    /// link fields take arrays of id strings. `id` is rejected.
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<()> {
        match field {
            "id" => Err(StoryGraphError::PatchInstruction(
                "entity id is immutable".to_string(),
            )),
            "name" => {
                self.name = as_text(field, value)?;
                Ok(())
            }
            "long_description" => {
                self.long_description = as_text(field, value)?;
                Ok(())
            }
            "type" => {
                self.entity_type = as_text(field, value)?;
                Ok(())
            }
            "image_ref" => {
                self.image_ref = match value {
                    Value::Null => None,
                    other => Some(as_text(field, other)?),
                };
                Ok(())
            }
            "parent_ids" => {
                self.parent_ids = as_id_list(field, value)?;
                Ok(())
            }
            "child_ids" => {
                self.child_ids = as_id_list(field, value)?;
                Ok(())
            }
            other => Err(StoryGraphError::PatchInstruction(format!(
                "unknown entity field '{}'",
                other
            ))),
        }
    }

    /// Replace a text field in place, used by diff application.
    pub fn set_text_field(&mut self, field: &str, text: String) -> Result<()> {
        match field {
            "name" => self.name = text,
            "long_description" => self.long_description = text,
            "type" => self.entity_type = text,
            "image_ref" => self.image_ref = Some(text),
            other => {
                return Err(StoryGraphError::PatchInstruction(format!(
                    "field '{}' is not diffable text",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn as_text(field: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            StoryGraphError::PatchInstruction(format!("field '{}' expects a string", field))
        })
}

fn as_id_list(field: &str, value: &Value) -> Result<Vec<EntityId>> {
    let items = value.as_array().ok_or_else(|| {
        StoryGraphError::PatchInstruction(format!("field '{}' expects an array of ids", field))
    })?;
    items
        .iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                StoryGraphError::PatchInstruction(format!(
                    "field '{}' expects string ids",
                    field
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builders_compose() {
        let e = Entity::new("n1", "Sword")
            .with_description("a simple sword")
            .with_type("item")
            .with_parent("armory");
        assert_eq!(e.id, "n1");
        assert_eq!(e.long_description, "a simple sword");
        assert_eq!(e.parent_ids, vec!["armory".to_string()]);
    }

    #[test]
    fn id_is_immutable_through_set_field() {
        let mut e = Entity::new("n1", "Sword");
        assert!(e.set_field("id", &json!("n2")).is_err());
        assert_eq!(e.id, "n1");
    }

    #[test]
    fn link_fields_take_id_arrays() {
        let mut e = Entity::new("n1", "Sword");
        e.set_field("child_ids", &json!(["c1", "c2"])).unwrap();
        assert_eq!(e.child_ids, vec!["c1".to_string(), "c2".to_string()]);
        assert!(e.set_field("child_ids", &json!("c1")).is_err());
    }
}
