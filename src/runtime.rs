//! Runtime build recipes.
//!
//! A [`RuntimeImage`] supplies the build file for the shared base snapshot
//! plus the default install steps and processes for sessions of that
//! runtime. The orchestrator never interprets the build file; it only hands
//! it to the sandbox provider.

use std::collections::BTreeMap;

/// Contract between the snapshot manager and a runtime recipe.
pub trait RuntimeImage: Send + Sync {
    /// Dockerfile content for the base snapshot build.
    fn dockerfile(&self) -> String;

    /// Install commands run after cloning, unless overridden per session.
    fn default_install(&self) -> Vec<String>;

    /// Procfile entries started for a session of this runtime.
    fn default_processes(&self) -> BTreeMap<String, String>;

    /// Port the app process listens on inside the sandbox.
    fn default_port(&self) -> u16;
}

/// Built-in Rails runtime: Ruby via mise, PostgreSQL, overmind as the
/// process supervisor, and cloudflared for the session tunnel.
pub struct RailsRuntime;

impl RuntimeImage for RailsRuntime {
    fn dockerfile(&self) -> String {
        r#"FROM ubuntu:24.04

RUN apt-get update && apt-get install -y \
    build-essential git curl libpq-dev libyaml-dev libssl-dev zlib1g-dev \
    postgresql postgresql-contrib tmux sudo ca-certificates \
    && rm -rf /var/lib/apt/lists/*

RUN curl -L https://github.com/DarthSim/overmind/releases/download/v2.5.1/overmind-v2.5.1-linux-amd64.gz \
    | gunzip > /usr/local/bin/overmind && chmod +x /usr/local/bin/overmind

RUN curl -L https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-amd64 \
    -o /usr/local/bin/cloudflared && chmod +x /usr/local/bin/cloudflared

RUN useradd -m -s /bin/bash daytona && echo 'daytona ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/daytona
USER daytona
WORKDIR /home/daytona

RUN curl https://mise.run | sh && \
    ~/.local/bin/mise use -g ruby@3.3 node@22 && \
    ~/.local/bin/mise exec -- gem install bundler

ENV PATH="/home/daytona/.local/share/mise/shims:/home/daytona/.local/bin:${PATH}"
"#
        .to_string()
    }

    fn default_install(&self) -> Vec<String> {
        vec![
            "bundle install".to_string(),
            "bin/rails db:prepare".to_string(),
        ]
    }

    fn default_processes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("web".to_string(), "bin/rails server -b 0.0.0.0".to_string())])
    }

    fn default_port(&self) -> u16 {
        3000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rails_recipe_is_complete() {
        let runtime = RailsRuntime;
        let dockerfile = runtime.dockerfile();
        assert!(dockerfile.contains("overmind"));
        assert!(dockerfile.contains("cloudflared"));
        assert!(dockerfile.contains("postgresql"));
        assert!(!runtime.default_install().is_empty());
        assert!(runtime.default_processes().contains_key("web"));
        assert_eq!(runtime.default_port(), 3000);
    }
}
