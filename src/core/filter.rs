//! 忽略规则：把 glob 列表编译成计划器使用的 ignore 判断

use super::task::IgnoreFn;
use crate::error::EngineError;
use regex::Regex;
use std::sync::Arc;

/// 常见的排除模式
pub const DEFAULT_IGNORE: &[&str] = &[".vscode", ".git", ".svn", ".DS_Store", "Thumbs.db"];

/// glob 匹配器
///
/// * `*` 匹配单级路径中的任意字符，`**` 可跨目录，`?` 匹配单个字符
/// * 不含 `/` 的模式匹配任意层级的同名条目
/// * 中间含 `/` 的模式从根开始匹配；末尾的 `/` 不影响锚定
/// * 与桌面端行为一致，不区分大小写
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    rules: Vec<Regex>,
}

impl IgnoreMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, EngineError> {
        let mut rules = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() || pattern.starts_with('#') {
                continue;
            }
            let re = Regex::new(&Self::to_regex(pattern)).map_err(|e| {
                EngineError::InvalidOptions(format!("忽略规则无效 {}: {}", pattern, e))
            })?;
            rules.push(re);
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 检查路径是否应该被排除
    pub fn is_match(&self, rel_path: &str) -> bool {
        let path = rel_path.trim_start_matches('/').trim_end_matches('/');
        !path.is_empty() && self.rules.iter().any(|re| re.is_match(path))
    }

    pub fn into_ignore_fn(self) -> IgnoreFn {
        Arc::new(move |path: &str| self.is_match(path))
    }

    fn to_regex(pattern: &str) -> String {
        let pattern = pattern.replace('\\', "/");
        let anchored = pattern.trim_end_matches('/').contains('/');
        let mut body = pattern.trim_start_matches('/').trim_end_matches('/');

        // a/** 也匹配 a 本身
        let mut subtree = false;
        if let Some(stripped) = body.strip_suffix("/**") {
            body = stripped;
            subtree = true;
        }

        let mut re = String::from("(?i)");
        re.push_str(if anchored { "^" } else { "(^|.*/)" });

        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '*' if chars.get(i + 1) == Some(&'*') => {
                    // **/ 匹配零或多级目录
                    if chars.get(i + 2) == Some(&'/') {
                        re.push_str("(.*/)?");
                        i += 3;
                    } else {
                        re.push_str(".*");
                        i += 2;
                    }
                    continue;
                }
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
            i += 1;
        }

        if subtree {
            re.push_str("(/.*)?");
        }
        re.push('$');
        re
    }
}
