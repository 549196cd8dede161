//! 限速
//! 每个 rate class 维护一个滑动平均值，平均值越大表示发送越稀疏
//! 平均值低于 alert 时排队，低于 limit 时进入受限状态，直到恢复到 clear

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use log::{debug, warn};
use tokio::time::Instant;

use crate::network::packet::snac::RateClassInfo;
use crate::network::packet::SnacCommand;

use super::{RequestError, RequestId};

/// 服务器没有声明的命令使用的 class，所有阈值为 0，不会限速
const DEFAULT_CLASS: u16 = 0;

/// 提交结果
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// 立即发送
    Send(SnacCommand),
    /// 已排队，等待 release
    Queued,
}

struct RateClass {
    info: RateClassInfo,
    avg: u32,
    last_send: Instant,
    /// 平均值曾跌破 limit，恢复到 clear 之前不按 alert 放行
    limited: bool,
    queue: VecDeque<(RequestId, SnacCommand)>,
}

impl RateClass {
    fn new(info: RateClassInfo, now: Instant) -> Self {
        let mut class = Self {
            avg: 0,
            last_send: now,
            limited: false,
            queue: VecDeque::new(),
            info,
        };
        class.reset(now);
        class
    }

    /// 使用服务器给出的平均值和上次发送时间
    fn reset(&mut self, now: Instant) {
        self.avg = self.info.current_avg;
        self.last_send = now
            .checked_sub(Duration::from_millis(self.info.last_ms as u64))
            .unwrap_or(now);
        self.limited = self.avg < self.info.limit_level;
    }

    fn window(&self) -> u64 {
        self.info.window_size.max(1) as u64
    }

    /// 如果现在发送，平均值会变成多少
    fn projected(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.last_send).as_millis() as u64;
        let window = self.window();
        let avg = (self.avg as u64 * (window - 1) + elapsed) / window;
        avg.min(self.info.max_avg as u64) as u32
    }

    fn threshold(&self) -> u32 {
        let level = if self.limited {
            self.info.clear_level
        } else {
            self.info.alert_level
        };
        level.min(self.info.max_avg)
    }

    fn limit(&self) -> u32 {
        self.info.limit_level.min(self.info.max_avg)
    }

    fn admissible(&self, now: Instant) -> bool {
        let projected = self.projected(now);
        self.avg.max(projected) >= self.threshold() && projected >= self.limit()
    }

    /// 平均值恢复到可以放行的时刻
    fn ready_at(&self) -> Instant {
        let target = if self.avg >= self.threshold() {
            self.limit()
        } else {
            self.threshold().max(self.limit())
        };
        let window = self.window();
        let wait = (target as u64 * window).saturating_sub(self.avg as u64 * (window - 1));
        self.last_send + Duration::from_millis(wait)
    }

    fn record(&mut self, now: Instant) {
        self.avg = self.projected(now);
        self.last_send = now;
        if self.avg < self.info.limit_level {
            if !self.limited {
                warn!(
                    "rate class {} fell below limit level: {} < {}",
                    self.info.class_id, self.avg, self.info.limit_level
                );
            }
            self.limited = true;
        } else if self.avg >= self.info.clear_level {
            self.limited = false;
        }
    }
}

/// 发送前按 rate class 排队
pub(crate) struct RateGovernor {
    classes: BTreeMap<u16, RateClass>,
    /// (family, subtype) -> class id
    commands: HashMap<(u16, u16), u16>,
    high_water_mark: usize,
}

impl RateGovernor {
    pub(crate) fn new(high_water_mark: usize, now: Instant) -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(
            DEFAULT_CLASS,
            RateClass::new(RateClassInfo::default(), now),
        );
        Self {
            classes,
            commands: HashMap::new(),
            high_water_mark,
        }
    }

    /// 安装服务器下发的 rate class，已在排队的命令保留
    pub(crate) fn install(&mut self, classes: &[RateClassInfo], now: Instant) {
        for info in classes {
            for key in &info.commands {
                self.commands.insert(*key, info.class_id);
            }
            self.upsert(info.clone(), now);
        }
    }

    /// 服务器通知平均值变化，以服务器为准
    pub(crate) fn update(&mut self, info: &RateClassInfo, now: Instant) {
        debug!(
            "rate class {} changed, current average {}",
            info.class_id, info.current_avg
        );
        self.upsert(info.clone(), now);
    }

    fn upsert(&mut self, mut info: RateClassInfo, now: Instant) {
        match self.classes.get_mut(&info.class_id) {
            Some(class) => {
                if info.commands.is_empty() {
                    info.commands = std::mem::take(&mut class.info.commands);
                }
                class.info = info;
                class.reset(now);
            }
            None => {
                self.classes
                    .insert(info.class_id, RateClass::new(info, now));
            }
        }
    }

    /// 服务器声明的 class id，不含默认 class
    #[cfg(test)]
    pub(crate) fn class_ids(&self) -> Vec<u16> {
        self.classes
            .keys()
            .copied()
            .filter(|id| *id != DEFAULT_CLASS)
            .collect()
    }

    fn class_of(&self, command: &SnacCommand) -> u16 {
        self.commands
            .get(&command.key())
            .copied()
            .filter(|id| self.classes.contains_key(id))
            .unwrap_or(DEFAULT_CLASS)
    }

    /// 提交一个已分配请求 id 的命令
    /// 队列已满时同步返回 RateBackpressure
    pub(crate) fn submit(
        &mut self,
        request_id: RequestId,
        command: SnacCommand,
        now: Instant,
    ) -> Result<Admission, RequestError> {
        let class_id = self.class_of(&command);
        let high_water_mark = self.high_water_mark;
        let class = match self.classes.get_mut(&class_id) {
            Some(class) => class,
            None => return Ok(Admission::Send(command)),
        };

        if class.queue.len() >= high_water_mark {
            return Err(RequestError::RateBackpressure);
        }
        if class.queue.is_empty() && class.admissible(now) {
            class.record(now);
            return Ok(Admission::Send(command));
        }

        debug!(
            "queue snac {:04x}/{:04x} in rate class {}, average {}",
            command.family, command.subtype, class_id, class.avg
        );
        class.queue.push_back((request_id, command));
        Ok(Admission::Queued)
    }

    /// 取出所有可以发送的排队命令，每个 class 内保持先进先出
    pub(crate) fn release(&mut self, now: Instant) -> Vec<(RequestId, SnacCommand)> {
        let mut released = Vec::new();
        for class in self.classes.values_mut() {
            while !class.queue.is_empty() && class.admissible(now) {
                if let Some(entry) = class.queue.pop_front() {
                    class.record(now);
                    released.push(entry);
                }
            }
        }
        released
    }

    /// 最早可以放行排队命令的时刻
    pub(crate) fn next_release(&self) -> Option<Instant> {
        self.classes
            .values()
            .filter(|class| !class.queue.is_empty())
            .map(RateClass::ready_at)
            .min()
    }

    /// 从队列中移除一个请求，请求取消或超时时调用
    pub(crate) fn remove(&mut self, request_id: RequestId) -> Option<SnacCommand> {
        for class in self.classes.values_mut() {
            if let Some(pos) = class.queue.iter().position(|(id, _)| *id == request_id) {
                return class.queue.remove(pos).map(|(_, command)| command);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.classes.values().map(|class| class.queue.len()).sum()
    }

    /// 丢弃所有排队命令
    pub(crate) fn clear(&mut self) -> Vec<RequestId> {
        self.classes
            .values_mut()
            .flat_map(|class| class.queue.drain(..).map(|(id, _)| id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    const IM: (u16, u16) = (0x0004, 0x0006);

    fn class_one(current_avg: u32) -> RateClassInfo {
        RateClassInfo {
            class_id: 1,
            window_size: 80,
            clear_level: 2900,
            alert_level: 2000,
            limit_level: 1500,
            disconnect_level: 800,
            current_avg,
            max_avg: 6000,
            last_ms: 0,
            commands: vec![IM],
        }
    }

    fn im() -> SnacCommand {
        SnacCommand::new(IM.0, IM.1, Bytes::new())
    }

    #[test]
    fn unknown_class_never_throttles() {
        let now = Instant::now();
        let mut governor = RateGovernor::new(2, now);
        governor.install(&[class_one(1000)], now);
        for id in 1..10 {
            let command = SnacCommand::new(0x0002, 0x0004, Bytes::new());
            assert!(matches!(
                governor.submit(id, command, now),
                Ok(Admission::Send(_))
            ));
        }
        assert_eq!(governor.class_ids(), vec![1]);
    }

    #[test]
    fn healthy_class_sends_immediately() {
        let now = Instant::now();
        let mut governor = RateGovernor::new(4, now);
        governor.install(&[class_one(2500)], now);
        assert_eq!(governor.submit(1, im(), now), Ok(Admission::Send(im())));
        assert_eq!(governor.next_release(), None);
    }

    #[test]
    fn alert_level_queues_until_recovered() {
        let now = Instant::now();
        let mut governor = RateGovernor::new(4, now);
        governor.install(&[class_one(1900)], now);
        assert_eq!(governor.submit(1, im(), now), Ok(Admission::Queued));

        // 2000 * 80 - 1900 * 79 = 9900
        let ready = now + Duration::from_millis(9900);
        assert_eq!(governor.next_release(), Some(ready));
        assert!(governor
            .release(ready - Duration::from_millis(1))
            .is_empty());
        assert_eq!(governor.release(ready), vec![(1, im())]);
        assert_eq!(governor.queued(), 0);
    }

    #[test]
    fn backpressure_then_fifo_drain_after_clear_level() {
        let now = Instant::now();
        let mut governor = RateGovernor::new(3, now);
        governor.install(&[class_one(1000)], now);

        for id in 1..=3 {
            let command = SnacCommand::new(IM.0, IM.1, Bytes::from(vec![id as u8]));
            assert_eq!(governor.submit(id, command, now), Ok(Admission::Queued));
        }
        assert_eq!(
            governor.submit(4, im(), now),
            Err(RequestError::RateBackpressure)
        );

        // 2900 * 80 - 1000 * 79 = 153000
        let clear = now + Duration::from_millis(153_000);
        assert_eq!(governor.next_release(), Some(clear));
        assert!(governor
            .release(clear - Duration::from_millis(1))
            .is_empty());

        let released = governor.release(clear);
        let ids = released.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
        let bodies = released
            .iter()
            .map(|(_, command)| command.body[0])
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec![1, 2, 3]);
    }

    #[test]
    fn rate_change_is_authoritative() {
        let now = Instant::now();
        let mut governor = RateGovernor::new(4, now);
        governor.install(&[class_one(1000)], now);
        assert_eq!(governor.submit(1, im(), now), Ok(Admission::Queued));

        let mut change = class_one(5000);
        change.commands.clear();
        governor.update(&change, now);

        // 原来的命令映射保留，队首按新的平均值放行
        assert_eq!(governor.release(now), vec![(1, im())]);
        assert!(matches!(
            governor.submit(2, im(), now),
            Ok(Admission::Send(_))
        ));
    }

    #[test]
    fn removed_request_is_not_released() {
        let now = Instant::now();
        let mut governor = RateGovernor::new(4, now);
        governor.install(&[class_one(1000)], now);
        governor.submit(1, im(), now).unwrap();
        governor.submit(2, im(), now).unwrap();

        assert_eq!(governor.remove(1), Some(im()));
        assert_eq!(governor.remove(1), None);
        let released = governor.release(now + Duration::from_secs(600));
        assert_eq!(released, vec![(2, im())]);
        assert!(governor.clear().is_empty());
    }
}
