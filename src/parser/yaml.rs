// YAML play parser

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::Path;

use super::ast::*;
use crate::output::errors::LoadError;

/// A play file holds either a list of plays or a single play
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Plays(Vec<RawPlay>),
    Single(RawPlay),
}

/// Raw YAML play structure (before AST conversion)
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlay {
    name: Option<String>,
    #[serde(default)]
    vars: BTreeMap<String, YamlValue>,
    #[serde(default)]
    tasks: Vec<RawTask>,
    #[serde(default)]
    handlers: Vec<RawTask>,
    /// Module name to task list
    #[serde(default)]
    modules: BTreeMap<String, Vec<RawTask>>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: Option<String>,
    when: Option<YamlValue>,
    items: Option<YamlValue>,
    register: Option<String>,
    notify: Option<NotifyValue>,
    #[serde(rename = "async", default)]
    run_async: bool,
    future: Option<String>,
    #[serde(default)]
    include_vars: BTreeMap<String, YamlValue>,
    /// The single remaining key names the command
    #[serde(flatten)]
    command: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NotifyValue {
    Single(String),
    Multiple(Vec<String>),
}

impl NotifyValue {
    fn into_vec(self) -> Vec<String> {
        match self {
            NotifyValue::Single(name) => vec![name],
            NotifyValue::Multiple(names) => names,
        }
    }
}

/// Parse plays from a file
pub fn parse_plays_file(path: &Path) -> Result<Vec<Play>, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_plays(&content)
}

/// Parse plays from YAML text
pub fn parse_plays(content: &str) -> Result<Vec<Play>, LoadError> {
    let raw: RawDocument = serde_yaml::from_str(content)?;
    let plays = match raw {
        RawDocument::Plays(plays) => plays,
        RawDocument::Single(play) => vec![play],
    };

    plays
        .into_iter()
        .enumerate()
        .map(|(index, play)| convert_play(play, index))
        .collect()
}

fn convert_play(raw: RawPlay, index: usize) -> Result<Play, LoadError> {
    let name = raw.name.unwrap_or_else(|| format!("play {}", index + 1));

    let tasks = convert_tasks(raw.tasks, &name, "task")?;
    let handlers = convert_tasks(raw.handlers, &name, "handler")?;

    let mut modules = BTreeMap::new();
    for (module_name, raw_tasks) in raw.modules {
        let tasks = convert_tasks(raw_tasks, &module_name, "module task")?;
        modules.insert(
            module_name.clone(),
            Module {
                name: module_name,
                tasks,
            },
        );
    }

    Ok(Play {
        name,
        vars: convert_vars(raw.vars),
        tasks,
        handlers,
        modules,
    })
}

fn convert_tasks(raw: Vec<RawTask>, owner: &str, kind: &str) -> Result<Vec<Task>, LoadError> {
    raw.into_iter()
        .enumerate()
        .map(|(index, task)| {
            convert_task(task).map_err(|message| {
                LoadError::Invalid(format!("{} {} of '{}': {}", kind, index + 1, owner, message))
            })
        })
        .collect()
}

fn convert_task(raw: RawTask) -> Result<Task, String> {
    let mut command = raw.command.into_iter();
    let (name, args) = match (command.next(), command.next()) {
        (Some(selected), None) => selected,
        (None, _) => return Err("no command given".to_string()),
        (Some((first, _)), Some((second, _))) => {
            return Err(format!(
                "more than one command given ('{}' and '{}')",
                first, second
            ))
        }
    };

    let mut task = Task::new(name, args_text(args)?);

    if let Some(task_name) = raw.name {
        task.name = task_name;
    }
    task.when = raw.when.map(scalar_text).transpose()?;
    task.items = raw.items.map(convert_items).transpose()?;
    task.register = raw.register;
    task.notify = raw.notify.map(NotifyValue::into_vec).unwrap_or_default();
    task.run_async = raw.run_async;
    task.future = raw.future;
    task.include_vars = convert_vars(raw.include_vars);

    Ok(task)
}

fn convert_items(value: YamlValue) -> Result<Items, String> {
    match value {
        YamlValue::Sequence(seq) => Ok(Items::List(seq.into_iter().map(yaml_to_value).collect())),
        YamlValue::String(name) => Ok(Items::Variable(name)),
        other => Err(format!("items must be a list or a variable name, got {:?}", other)),
    }
}

/// Command arguments: a string, a scalar, or a mapping rendered as `k=v` pairs
fn args_text(value: YamlValue) -> Result<String, String> {
    match value {
        YamlValue::Null => Ok(String::new()),
        YamlValue::Mapping(map) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (k, v) in map {
                let key = scalar_text(k)?;
                let value = scalar_text(v)?;
                pairs.push(format!("{}={}", key, quote_arg(&value)));
            }
            Ok(pairs.join(" "))
        }
        other => scalar_text(other),
    }
}

fn scalar_text(value: YamlValue) -> Result<String, String> {
    match value {
        YamlValue::Null => Ok(String::new()),
        YamlValue::Bool(b) => Ok(b.to_string()),
        YamlValue::Number(n) => Ok(n.to_string()),
        YamlValue::String(s) => Ok(s),
        YamlValue::Tagged(tagged) => scalar_text(tagged.value),
        other => Err(format!("expected a scalar, got {:?}", other)),
    }
}

fn quote_arg(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn convert_vars(vars: BTreeMap<String, YamlValue>) -> Vars {
    vars.into_iter().map(|(k, v)| (k, yaml_to_value(v))).collect()
}

fn yaml_to_value(yaml: YamlValue) -> Value {
    match yaml {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                Value::Int(0)
            }
        }
        YamlValue::String(s) => Value::String(s),
        YamlValue::Sequence(seq) => Value::List(seq.into_iter().map(yaml_to_value).collect()),
        YamlValue::Mapping(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        YamlValue::String(s) => s,
                        other => scalar_text(other).unwrap_or_default(),
                    };
                    (key, yaml_to_value(v))
                })
                .collect(),
        ),
        YamlValue::Tagged(tagged) => yaml_to_value(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple_play() {
        let yaml = r#"
- name: web
  vars:
    pkg: nginx
    ports: [80, 443]
  tasks:
    - name: install {{ pkg }}
      shell: echo installing {{ pkg }}
      notify: restart
    - command: echo one
      when: false
      register: out
  handlers:
    - name: restart
      shell: echo restarting
"#;
        let plays = parse_plays(yaml).unwrap();
        assert_eq!(plays.len(), 1);

        let play = &plays[0];
        assert_eq!(play.name, "web");
        assert_eq!(play.vars.get("pkg"), Some(&Value::from("nginx")));
        assert_eq!(
            play.vars.get("ports"),
            Some(&Value::List(vec![Value::Int(80), Value::Int(443)]))
        );

        assert_eq!(
            play.tasks[0],
            Task::new("shell", "echo installing {{ pkg }}")
                .named("install {{ pkg }}")
                .with_notify("restart")
        );
        assert_eq!(play.tasks[1].name, "command");
        assert_eq!(play.tasks[1].when.as_deref(), Some("false"));
        assert_eq!(play.tasks[1].register.as_deref(), Some("out"));
        assert_eq!(play.handlers[0].name, "restart");
    }

    #[test]
    fn test_parse_dispatch_fields() {
        let yaml = r#"
name: dispatch
tasks:
  - shell: sleep 1
    future: nap
  - shell: echo bg
    async: true
  - shell: echo {{ item }}
    items: [a, b]
  - shell: echo {{ item }}
    items: "{{ packages }}"
  - copy:
      src: /tmp/a file
      dest: /tmp/b
    notify: [reload, restart]
    include_vars:
      mode: "0644"
"#;
        let plays = parse_plays(yaml).unwrap();
        let tasks = &plays[0].tasks;

        assert_eq!(tasks[0].future.as_deref(), Some("nap"));
        assert!(tasks[1].run_async);
        assert_eq!(
            tasks[2].items,
            Some(Items::List(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(
            tasks[3].items,
            Some(Items::Variable("{{ packages }}".to_string()))
        );
        assert_eq!(tasks[4].args, r#"src="/tmp/a file" dest=/tmp/b"#);
        assert_eq!(tasks[4].notify, vec!["reload", "restart"]);
        assert_eq!(tasks[4].include_vars.get("mode"), Some(&Value::from("0644")));
    }

    #[test]
    fn test_parse_modules() {
        let yaml = r#"
- name: with modules
  modules:
    deploy:
      - shell: echo deploying {{ target }}
        notify: restart
  tasks:
    - deploy: target=web
"#;
        let plays = parse_plays(yaml).unwrap();
        let module = &plays[0].modules["deploy"];
        assert_eq!(module.name, "deploy");
        assert_eq!(module.tasks.len(), 1);
        assert_eq!(plays[0].tasks[0].command, "deploy");
        assert_eq!(plays[0].tasks[0].args, "target=web");
    }

    #[test]
    fn test_task_needs_exactly_one_command() {
        let missing = "- tasks:\n    - name: nothing\n";
        assert!(matches!(parse_plays(missing), Err(LoadError::Invalid(_))));

        let double = "- tasks:\n    - shell: a\n      command: b\n";
        match parse_plays(double) {
            Err(LoadError::Invalid(message)) => assert!(message.contains("more than one")),
            other => panic!("expected invalid task, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(parse_plays("- [unclosed"), Err(LoadError::Yaml(_))));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.yml");
        std::fs::write(&path, "- name: file play\n  tasks:\n    - shell: 'true'\n").unwrap();

        let plays = parse_plays_file(&path).unwrap();
        assert_eq!(plays[0].name, "file play");
        assert!(matches!(
            parse_plays_file(&dir.path().join("absent.yml")),
            Err(LoadError::Io { .. })
        ));
    }
}
