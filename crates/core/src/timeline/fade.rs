use crate::{ChannelLevels, Millis};

/// Linear cross-fade between two sets of channel levels.
#[derive(Debug, Clone, PartialEq)]
pub struct Fade {
    from: ChannelLevels,
    to: ChannelLevels,
    started_at: Millis,
    duration_ms: Millis,
}

impl Fade {
    /// Channels present on only one side are treated as 0 on the other.
    pub fn new(from: ChannelLevels, to: &ChannelLevels, started_at: Millis, duration_ms: Millis) -> Self {
        let mut from = from;
        let mut to = to.clone();
        for channel in to.keys() {
            from.entry(*channel).or_insert(0);
        }
        for channel in from.keys() {
            to.entry(*channel).or_insert(0);
        }
        Self {
            from,
            to,
            started_at,
            duration_ms: duration_ms.max(1),
        }
    }

    pub fn progress(&self, now: Millis) -> f32 {
        let elapsed = now.saturating_sub(self.started_at) as f32;
        (elapsed / self.duration_ms as f32).min(1.0)
    }

    pub fn is_complete(&self, now: Millis) -> bool {
        self.progress(now) >= 1.0
    }

    pub fn target(&self) -> &ChannelLevels {
        &self.to
    }

    /// Interpolated levels at `now`, floored to integers. A completed fade
    /// yields the exact target.
    pub fn sample(&self, now: Millis) -> ChannelLevels {
        let progress = self.progress(now);
        if progress >= 1.0 {
            return self.to.clone();
        }

        self.from
            .iter()
            .map(|(channel, start)| {
                let start = f32::from(*start);
                let end = f32::from(self.to.get(channel).copied().unwrap_or(0));
                let value = (start + (end - start) * progress).floor().clamp(0.0, 255.0);
                (*channel, value as u8)
            })
            .collect()
    }
}
